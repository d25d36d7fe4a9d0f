use mlua::{Function, IntoLuaMulti, Value};

use crate::error::{BridgeError, Result};
use crate::lua::{ReadResult, ReadValue, ResultOrError, ScriptVm, ValueHandle};

/// Call `level:member(args...)`, leaving its return values on the VM stack.
///
/// `Ok(None)` when the level does not define `member`; callers decide what
/// absence means. Errors raised by the script come back as
/// [`BridgeError::Script`] prefixed with the member name.
pub(super) fn call_level<'vm, A>(
    vm: &'vm ScriptVm,
    level: &ValueHandle,
    member: &str,
    args: A,
) -> Result<Option<usize>>
where
    A: IntoLuaMulti<'vm>,
{
    if !level.is_bound() {
        return Err(BridgeError::contract(member, "level script is not loaded"));
    }
    let function: Function = match level.look_up(vm, member) {
        ReadResult::Found(function) => function,
        ReadResult::NotFound => return Ok(None),
        ReadResult::TypeMismatch => {
            return Err(BridgeError::contract(member, "level member must be a function"))
        }
    };
    let args = args.into_lua_multi(vm.lua())?;
    let nargs = args.len() + 1;
    vm.push(function)?;
    level.push(vm)?;
    for arg in args {
        vm.push(arg)?;
    }
    match vm.call(nargs) {
        ResultOrError::Count(count) => Ok(Some(count)),
        ResultOrError::Error(message) => Err(BridgeError::script(member, message)),
    }
}

/// Read every entry of a script-supplied spec array. The first failing entry
/// aborts the whole read with `"<noun> <i>: <reason>"`.
pub(super) fn read_spec_array<'vm, T>(
    vm: &'vm ScriptVm,
    api: &str,
    noun: &str,
    value: Value<'vm>,
    mut read: impl FnMut(&ValueHandle) -> std::result::Result<T, String>,
) -> Result<Vec<T>> {
    let specs = match ValueHandle::read_value(vm.lua(), value) {
        ReadResult::Found(specs) if specs.is_table(vm) => specs,
        _ => return Err(BridgeError::contract(api, "must return a table")),
    };
    let mut entries = Vec::with_capacity(specs.array_size(vm));
    for index in 1..=specs.array_size(vm) {
        let entry = match specs.look_up::<_, ValueHandle>(vm, index) {
            ReadResult::Found(entry) if entry.is_table(vm) => entry,
            _ => {
                return Err(BridgeError::contract(
                    api,
                    format!("{noun} {index}: must be a table"),
                ))
            }
        };
        let item = read(&entry)
            .map_err(|reason| BridgeError::contract(api, format!("{noun} {index}: {reason}")))?;
        entries.push(item);
    }
    Ok(entries)
}
