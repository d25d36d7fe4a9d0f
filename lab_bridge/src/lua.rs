//! Script VM wrapper and the generic native/script plumbing built on it.

mod class;
mod handle;
mod modules;
mod read;
mod result;
mod stack;

pub use class::{ClassBinding, ClassInstance, DispatchError, LuaClass, Method};
pub use handle::ValueHandle;
pub use read::{ReadResult, ReadValue};
pub(crate) use read::{integral, number};
pub use result::{error_message, raise, ResultOrError, EMPTY_ERROR_MESSAGE};
pub use stack::StackScope;

use std::cell::{Cell, RefCell};
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use mlua::{
    Error as LuaError, Function, IntoLua, Lua, LuaOptions, MultiValue, RegistryKey,
    Result as LuaResult, StdLib, Table, Value,
};

use modules::{ModuleSource, ModuleTable};

/// Owns one interpreter instance.
///
/// Besides the interpreter itself the VM keeps a scratch value stack that
/// every native-to-script call goes through: callers push a function and its
/// arguments, [`ScriptVm::call`] replaces them with the return values and
/// reports how many there are. The stack is shared by every operation of a
/// [`crate::Context`], so each operation must restore the depth it found
/// (see [`StackScope`]).
pub struct ScriptVm {
    stack: RegistryKey,
    depth: Cell<usize>,
    modules: Rc<RefCell<ModuleTable>>,
    lua: Lua,
}

impl fmt::Debug for ScriptVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptVm")
            .field("depth", &self.depth.get())
            .field("modules", &self.modules.borrow().len())
            .finish()
    }
}

impl ScriptVm {
    pub fn new() -> LuaResult<Self> {
        let lua = Lua::new_with(StdLib::ALL_SAFE, LuaOptions::default())?;
        let stack = lua.create_registry_value(lua.create_table()?)?;
        let modules = Rc::new(RefCell::new(ModuleTable::default()));
        modules::install_searcher(&lua, modules.clone())?;
        Ok(Self {
            stack,
            depth: Cell::new(0),
            modules,
            lua,
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    pub fn push<'lua, V: IntoLua<'lua>>(&'lua self, value: V) -> LuaResult<()> {
        let value = value.into_lua(&self.lua)?;
        let depth = self.depth.get() + 1;
        self.stack_table()?.raw_set(depth, value)?;
        self.depth.set(depth);
        Ok(())
    }

    /// Value at a stack position: 1-based from the bottom, or negative to
    /// count from the top (`-1` is the top).
    pub fn get(&self, index: isize) -> LuaResult<Value<'_>> {
        let slot = self.absolute_index(index).ok_or_else(|| {
            LuaError::RuntimeError(format!(
                "stack index {index} out of range (depth {})",
                self.depth.get()
            ))
        })?;
        self.stack_table()?.raw_get(slot)
    }

    /// The `position`-th of the `count` values on top of the stack, or nil
    /// when `position` is past the end.
    pub fn result(&self, count: usize, position: usize) -> LuaResult<Value<'_>> {
        if position >= count {
            return Ok(Value::Nil);
        }
        self.get(position as isize - count as isize)
    }

    pub fn pop(&self, count: usize) {
        self.truncate(self.depth.get().saturating_sub(count));
    }

    /// Drop every value above `depth`. Never grows the stack.
    pub fn truncate(&self, depth: usize) {
        let current = self.depth.get();
        if depth >= current {
            return;
        }
        if let Ok(table) = self.stack_table() {
            for slot in depth + 1..=current {
                let _ = table.raw_set(slot, Value::Nil);
            }
        }
        self.depth.set(depth);
    }

    /// Call the function sitting below the top `nargs` values. The function
    /// and its arguments are popped; on success every return value is pushed
    /// and counted, on error nothing is pushed.
    pub fn call(&self, nargs: usize) -> ResultOrError {
        let depth = self.depth.get();
        assert!(
            nargs < depth,
            "call of {nargs} arguments needs a function below them (depth {depth})"
        );
        let base = depth - nargs - 1;
        match self.invoke(base) {
            Ok(count) => ResultOrError::count(count),
            Err(err) => {
                self.truncate(base);
                ResultOrError::from(err)
            }
        }
    }

    /// Compile and run a chunk (source text or precompiled bytecode), leaving
    /// its return values on the stack.
    pub fn load_chunk(&self, name: &str, bytes: &[u8]) -> ResultOrError {
        let function = match self.lua.load(bytes).set_name(name).into_function() {
            Ok(function) => function,
            Err(err) => return ResultOrError::from(err),
        };
        if let Err(err) = self.push(function) {
            return ResultOrError::from(err);
        }
        self.call(0)
    }

    /// Register a module resolved by `require(name)` through a native loader.
    /// State the module needs is captured by the closure.
    pub fn add_native_module<F>(&self, name: impl Into<String>, loader: F)
    where
        F: for<'lua> Fn(&'lua Lua) -> LuaResult<Value<'lua>> + 'static,
    {
        let name = name.into();
        log::debug!("registering native module {name}");
        self.modules
            .borrow_mut()
            .insert(name, ModuleSource::Native(Rc::new(loader)));
    }

    /// Register a module resolved by `require(name)` from in-memory source.
    pub fn add_embedded_module(&self, name: impl Into<String>, source: impl Into<Vec<u8>>) {
        let name = name.into();
        let source: Vec<u8> = source.into();
        log::debug!("registering embedded module {name}");
        self.modules
            .borrow_mut()
            .insert(name, ModuleSource::Embedded(Rc::from(source)));
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.borrow().contains(name)
    }

    /// Make `require` search `dir/?.lua` ahead of the existing path. A
    /// directory already on the path is left where it is.
    pub fn add_path_to_search_list(&self, dir: &Path) -> LuaResult<()> {
        let package: Table = self.lua.globals().get("package")?;
        let current_path: String = package.get("path")?;
        let entry = format!("{}/?.lua", dir.display());
        if current_path.split(';').any(|existing| existing == entry) {
            return Ok(());
        }
        package.set("path", format!("{entry};{current_path}"))?;
        Ok(())
    }

    /// Move the top `count` values down so they start right above `depth`,
    /// dropping whatever sat between.
    pub(crate) fn settle(&self, depth: usize, count: usize) -> LuaResult<()> {
        let current = self.depth.get();
        let count = count.min(current.saturating_sub(depth));
        let first = current - count + 1;
        if first > depth + 1 {
            let table = self.stack_table()?;
            for offset in 0..count {
                let value: Value = table.raw_get(first + offset)?;
                table.raw_set(depth + 1 + offset, value)?;
            }
        }
        self.truncate(depth + count);
        Ok(())
    }

    fn invoke(&self, base: usize) -> LuaResult<usize> {
        let mut values = self.take_above(base)?;
        let callee = values.remove(0);
        let function = match callee {
            Value::Function(function) => function,
            other => {
                return Err(LuaError::RuntimeError(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )))
            }
        };
        let results = call_function(&function, values)?;
        let count = results.len();
        for value in results {
            self.push(value)?;
        }
        Ok(count)
    }

    fn take_above(&self, base: usize) -> LuaResult<Vec<Value<'_>>> {
        let table = self.stack_table()?;
        let mut values = Vec::with_capacity(self.depth.get() - base);
        for slot in base + 1..=self.depth.get() {
            values.push(table.raw_get(slot)?);
        }
        self.truncate(base);
        Ok(values)
    }

    fn absolute_index(&self, index: isize) -> Option<usize> {
        let depth = self.depth.get() as isize;
        let slot = if index < 0 { depth + 1 + index } else { index };
        (slot >= 1 && slot <= depth).then_some(slot as usize)
    }

    fn stack_table(&self) -> LuaResult<Table<'_>> {
        self.lua.registry_value(&self.stack)
    }
}

/// Builds the table returned by a native module. Functions added through
/// it accept both `module.f(...)` and `module:f(...)`.
pub struct ModuleBuilder<'lua> {
    lua: &'lua Lua,
    table: Table<'lua>,
    this: Rc<RegistryKey>,
}

impl<'lua> ModuleBuilder<'lua> {
    pub fn new(lua: &'lua Lua) -> LuaResult<Self> {
        let table = lua.create_table()?;
        let this = Rc::new(lua.create_registry_value(table.clone())?);
        Ok(Self { lua, table, this })
    }

    pub fn function<F>(&self, name: &str, function: F) -> LuaResult<()>
    where
        F: for<'a> Fn(&'a Lua, Vec<Value<'a>>) -> LuaResult<MultiValue<'a>> + 'static,
    {
        let this = self.this.clone();
        let wrapped = self.lua.create_function(move |lua, args: MultiValue| {
            let mut args = args.into_vec();
            if let Some(Value::Table(first)) = args.first() {
                let module: Table = lua.registry_value(&this)?;
                if *first == module {
                    args.remove(0);
                }
            }
            function(lua, args)
        })?;
        self.table.raw_set(name, wrapped)
    }

    pub fn set<V: IntoLua<'lua>>(&self, name: &str, value: V) -> LuaResult<()> {
        self.table.raw_set(name, value)
    }

    pub fn finish(self) -> Value<'lua> {
        Value::Table(self.table)
    }
}

fn call_function<'lua>(
    function: &Function<'lua>,
    args: Vec<Value<'lua>>,
) -> LuaResult<Vec<Value<'lua>>> {
    let results = function.call::<_, MultiValue>(MultiValue::from_vec(args))?;
    Ok(results.into_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlua::IntoLuaMulti;

    #[test]
    fn push_get_and_truncate_track_depth() {
        let vm = ScriptVm::new().expect("vm");
        vm.push(1).expect("push");
        vm.push("two").expect("push");
        vm.push(Value::Nil).expect("push");
        assert_eq!(vm.depth(), 3);
        let bottom: i64 = vm.lua().unpack(vm.get(1).expect("get")).expect("integer");
        assert_eq!(bottom, 1);
        assert!(matches!(vm.get(-1).expect("top"), Value::Nil));
        assert!(vm.get(4).is_err());
        assert!(vm.get(0).is_err());
        vm.truncate(1);
        assert_eq!(vm.depth(), 1);
        vm.truncate(5);
        assert_eq!(vm.depth(), 1);
        vm.pop(3);
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn call_replaces_function_and_args_with_results() {
        let vm = ScriptVm::new().expect("vm");
        let function: Function = vm
            .lua()
            .load("return function(a, b) return a + b, a * b end")
            .eval()
            .expect("function");
        vm.push("marker").expect("push");
        vm.push(function).expect("push");
        vm.push(3).expect("push");
        vm.push(4).expect("push");
        assert_eq!(vm.call(2), ResultOrError::count(2));
        assert_eq!(vm.depth(), 3);
        let sum: i64 = vm.lua().unpack(vm.result(2, 0).expect("sum")).expect("integer");
        let product: i64 = vm
            .lua()
            .unpack(vm.result(2, 1).expect("product"))
            .expect("integer");
        assert_eq!((sum, product), (7, 12));
        assert!(matches!(vm.result(2, 2).expect("past end"), Value::Nil));
    }

    #[test]
    fn call_error_leaves_stack_at_base() {
        let vm = ScriptVm::new().expect("vm");
        let function: Function = vm
            .lua()
            .load("return function() error('level broke', 0) end")
            .eval()
            .expect("function");
        vm.push(function).expect("push");
        vm.push(true).expect("push");
        let result = vm.call(1);
        assert_eq!(result.error_message(), Some("level broke"));
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn calling_a_non_function_is_an_error() {
        let vm = ScriptVm::new().expect("vm");
        vm.push(5).expect("push");
        let result = vm.call(0);
        assert!(result
            .error_message()
            .is_some_and(|message| message.starts_with("attempt to call a")));
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn load_chunk_leaves_results_and_reports_syntax_errors() {
        let vm = ScriptVm::new().expect("vm");
        assert_eq!(vm.load_chunk("ok", b"return 1, 2, 3"), ResultOrError::count(3));
        assert_eq!(vm.depth(), 3);
        vm.truncate(0);
        let broken = vm.load_chunk("broken", b"return +");
        assert!(!broken.is_ok());
        assert_eq!(vm.depth(), 0);
    }

    #[test]
    fn settle_moves_results_above_depth() {
        let vm = ScriptVm::new().expect("vm");
        vm.push("keep").expect("push");
        vm.push("scratch").expect("push");
        vm.push("scratch").expect("push");
        vm.push("r1").expect("push");
        vm.push("r2").expect("push");
        vm.settle(1, 2).expect("settle");
        assert_eq!(vm.depth(), 3);
        let top: String = vm.lua().unpack(vm.get(-1).expect("top")).expect("string");
        let below: String = vm.lua().unpack(vm.get(2).expect("second")).expect("string");
        assert_eq!(top, "r2");
        assert_eq!(below, "r1");
    }

    #[test]
    fn native_module_is_found_by_require() {
        let vm = ScriptVm::new().expect("vm");
        vm.add_native_module("lab.answer", |lua| {
            let module = lua.create_table()?;
            module.set("value", 42)?;
            Ok(Value::Table(module))
        });
        assert!(vm.has_module("lab.answer"));
        let value: i64 = vm
            .lua()
            .load("return require('lab.answer').value")
            .eval()
            .expect("require");
        assert_eq!(value, 42);
    }

    #[test]
    fn embedded_module_is_compiled_on_require() {
        let vm = ScriptVm::new().expect("vm");
        vm.add_embedded_module("lab.helpers", "return { double = function(x) return x * 2 end }");
        let value: i64 = vm
            .lua()
            .load("return require('lab.helpers').double(21)")
            .eval()
            .expect("require");
        assert_eq!(value, 42);
    }

    #[test]
    fn unknown_module_reports_native_search() {
        let vm = ScriptVm::new().expect("vm");
        let err = vm
            .lua()
            .load("return require('lab.missing')")
            .exec()
            .expect_err("missing module");
        assert!(error_message(&err).contains("no native module 'lab.missing'"));
    }

    #[test]
    fn module_functions_accept_dot_and_colon_calls() {
        let vm = ScriptVm::new().expect("vm");
        vm.add_native_module("lab.count", |lua| {
            let module = ModuleBuilder::new(lua)?;
            module.function("count", |lua, args| args.len().into_lua_multi(lua))?;
            Ok(module.finish())
        });
        let (dot, colon, table_arg): (i64, i64, i64) = vm
            .lua()
            .load(
                "local m = require('lab.count')\n\
                 return m.count(1, 2), m:count(1, 2), m.count({}, 2)",
            )
            .eval()
            .expect("calls");
        assert_eq!((dot, colon, table_arg), (2, 2, 2));
    }

    #[test]
    fn search_path_finds_scripts_in_added_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("helper.lua"), "return { name = 'helper' }")
            .expect("write helper");
        let vm = ScriptVm::new().expect("vm");
        vm.add_path_to_search_list(dir.path()).expect("path");
        let name: String = vm
            .lua()
            .load("return require('helper').name")
            .eval()
            .expect("require");
        assert_eq!(name, "helper");
    }
}
