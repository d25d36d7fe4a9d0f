use std::ptr;

use mlua::{IntoLua, Lua, RegistryKey, Result as LuaResult, Table, Value};

use super::{ReadResult, ReadValue, ScriptVm};

/// Durable reference to a script value, usually a table.
///
/// The value lives in the interpreter registry so it stays alive across
/// calls and is unaffected by the VM stack. A handle may be unbound; every
/// operation that needs the value panics on an unbound handle, which is a
/// bug in the native caller rather than in the script.
#[derive(Debug, Default)]
pub struct ValueHandle {
    key: Option<RegistryKey>,
}

impl ValueHandle {
    pub fn unbound() -> Self {
        Self { key: None }
    }

    /// Handle to a fresh empty table.
    pub fn create(vm: &ScriptVm) -> LuaResult<Self> {
        let table = vm.lua().create_table()?;
        Self::from_value(vm.lua(), Value::Table(table))
    }

    pub fn from_value<'lua>(lua: &'lua Lua, value: Value<'lua>) -> LuaResult<Self> {
        Ok(Self {
            key: Some(lua.create_registry_value(value)?),
        })
    }

    /// Bind to the table or userdata at a stack position.
    pub fn read(vm: &ScriptVm, index: isize) -> ReadResult<Self> {
        match vm.get(index) {
            Ok(value) => Self::read_value(vm.lua(), value),
            Err(_) => ReadResult::NotFound,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.key.is_some()
    }

    pub fn is_table(&self, vm: &ScriptVm) -> bool {
        self.is_bound() && matches!(self.value(vm), Value::Table(_))
    }

    pub fn value<'vm>(&self, vm: &'vm ScriptVm) -> Value<'vm> {
        let key = self.key();
        vm.lua()
            .registry_value(key)
            .unwrap_or_else(|err| panic!("value handle does not belong to this VM: {err}"))
    }

    pub fn push(&self, vm: &ScriptVm) -> LuaResult<()> {
        vm.push(self.value(vm))
    }

    /// Raw lookup of `key` in the referenced table.
    pub fn look_up<'vm, K, T>(&self, vm: &'vm ScriptVm, key: K) -> ReadResult<T>
    where
        K: IntoLua<'vm>,
        T: ReadValue<'vm>,
    {
        let Some(table) = self.table(vm) else {
            return ReadResult::TypeMismatch;
        };
        match table.raw_get::<_, Value>(key) {
            Ok(value) => T::read_value(vm.lua(), value),
            Err(_) => ReadResult::TypeMismatch,
        }
    }

    /// Field that must be present with the right type. The message names the
    /// field and what was expected.
    pub fn required<'vm, T: ReadValue<'vm>>(&self, vm: &'vm ScriptVm, key: &str) -> Result<T, String> {
        match self.look_up(vm, key) {
            ReadResult::Found(value) => Ok(value),
            ReadResult::NotFound => Err(format!("missing '{key}'")),
            ReadResult::TypeMismatch => Err(format!("'{key}' must be {}", T::EXPECTED)),
        }
    }

    /// Field that may be absent but must have the right type when present.
    pub fn optional<'vm, T: ReadValue<'vm>>(
        &self,
        vm: &'vm ScriptVm,
        key: &str,
    ) -> Result<Option<T>, String> {
        match self.look_up(vm, key) {
            ReadResult::Found(value) => Ok(Some(value)),
            ReadResult::NotFound => Ok(None),
            ReadResult::TypeMismatch => Err(format!("'{key}' must be {}", T::EXPECTED)),
        }
    }

    pub fn contains<'vm, K: IntoLua<'vm>>(&self, vm: &'vm ScriptVm, key: K) -> bool {
        self.look_up::<K, Value>(vm, key).is_found()
    }

    pub fn insert<'vm, K, V>(&self, vm: &'vm ScriptVm, key: K, value: V) -> LuaResult<()>
    where
        K: IntoLua<'vm>,
        V: IntoLua<'vm>,
    {
        match self.table(vm) {
            Some(table) => table.raw_set(key, value),
            None => Err(mlua::Error::RuntimeError(
                "value handle does not reference a table".to_string(),
            )),
        }
    }

    /// Length of the array part, zero for anything but a table.
    pub fn array_size(&self, vm: &ScriptVm) -> usize {
        self.table(vm).map_or(0, |table| table.raw_len())
    }

    /// Number of keys of any kind.
    pub fn key_count(&self, vm: &ScriptVm) -> usize {
        self.table(vm).map_or(0, |table| {
            table.pairs::<Value, Value>().filter(Result::is_ok).count()
        })
    }

    /// Insert a new empty table under `key` and return a handle to it.
    pub fn create_sub_table<'vm, K: IntoLua<'vm>>(
        &self,
        vm: &'vm ScriptVm,
        key: K,
    ) -> LuaResult<ValueHandle> {
        let table = vm.lua().create_table()?;
        self.insert(vm, key, table.clone())?;
        Self::from_value(vm.lua(), Value::Table(table))
    }

    /// Second handle to the same value.
    pub fn duplicate(&self, vm: &ScriptVm) -> LuaResult<Self> {
        if !self.is_bound() {
            return Ok(Self::unbound());
        }
        Self::from_value(vm.lua(), self.value(vm))
    }

    /// Move the reference out, leaving this handle unbound.
    pub fn take(&mut self) -> Self {
        Self {
            key: self.key.take(),
        }
    }

    /// Handles are equal when they reference the same value.
    pub fn equals(&self, vm: &ScriptVm, other: &ValueHandle) -> bool {
        match (&self.key, &other.key) {
            (None, None) => true,
            (Some(left), Some(right)) => {
                ptr::eq(left, right) || self.value(vm) == other.value(vm)
            }
            _ => false,
        }
    }

    /// Drop the reference now instead of waiting for registry cleanup.
    pub fn release(mut self, vm: &ScriptVm) {
        if let Some(key) = self.key.take() {
            if let Err(err) = vm.lua().remove_registry_value(key) {
                log::warn!("failed to release value handle: {err}");
            }
        }
    }

    fn key(&self) -> &RegistryKey {
        match &self.key {
            Some(key) => key,
            None => panic!("dereferenced an unbound value handle"),
        }
    }

    fn table<'vm>(&self, vm: &'vm ScriptVm) -> Option<Table<'vm>> {
        match self.value(vm) {
            Value::Table(table) => Some(table),
            _ => None,
        }
    }
}

impl<'lua> ReadValue<'lua> for ValueHandle {
    const EXPECTED: &'static str = "a table";

    fn read_value(lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        match value {
            Value::Nil => ReadResult::NotFound,
            Value::Table(_) | Value::UserData(_) => match Self::from_value(lua, value) {
                Ok(handle) => ReadResult::Found(handle),
                Err(_) => ReadResult::TypeMismatch,
            },
            _ => ReadResult::TypeMismatch,
        }
    }
}
