use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};

pub(super) type NativeLoader = Rc<dyn for<'lua> Fn(&'lua Lua) -> LuaResult<Value<'lua>>>;

#[derive(Clone)]
pub(super) enum ModuleSource {
    Native(NativeLoader),
    Embedded(Rc<[u8]>),
}

#[derive(Default)]
pub(super) struct ModuleTable {
    modules: HashMap<String, ModuleSource>,
}

impl ModuleTable {
    pub(super) fn insert(&mut self, name: String, source: ModuleSource) {
        if self.modules.insert(name.clone(), source).is_some() {
            log::warn!("module {name} registered twice; keeping the latest");
        }
    }

    pub(super) fn get(&self, name: &str) -> Option<ModuleSource> {
        self.modules.get(name).cloned()
    }

    pub(super) fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub(super) fn len(&self) -> usize {
        self.modules.len()
    }
}

/// Put a searcher for registered modules right after `package.preload` so
/// native and embedded modules win over files on the search path.
pub(super) fn install_searcher(lua: &Lua, modules: Rc<RefCell<ModuleTable>>) -> LuaResult<()> {
    let package: Table = lua.globals().get("package")?;
    let loaders: Table = match package.get::<_, Option<Table>>("loaders")? {
        Some(loaders) => loaders,
        None => package.get("searchers")?,
    };

    let searcher = lua.create_function(move |lua, name: String| -> LuaResult<Value> {
        let source = modules.borrow().get(&name);
        match source {
            Some(ModuleSource::Native(loader)) => {
                let function = lua.create_function(move |lua, _: MultiValue| loader(lua))?;
                Ok(Value::Function(function))
            }
            Some(ModuleSource::Embedded(source)) => {
                let chunk = lua
                    .load(&source[..])
                    .set_name(name.as_str())
                    .into_function()?;
                Ok(Value::Function(chunk))
            }
            None => {
                let message = format!("\n\tno native module '{name}'");
                Ok(Value::String(lua.create_string(&message)?))
            }
        }
    })?;

    let len = loaders.raw_len();
    for index in (2..=len).rev() {
        let entry: Value = loaders.raw_get(index)?;
        loaders.raw_set(index + 1, entry)?;
    }
    loaders.raw_set(2, searcher)?;
    Ok(())
}
