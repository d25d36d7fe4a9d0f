use std::fmt::Display;

use mlua::{Error as LuaError, IntoLua, IntoLuaMulti, Lua, MultiValue, Result as LuaResult, Value};

use super::{Element, Tensor, TensorError};
use crate::lua::{
    integral, number, raise, ClassBinding, LuaClass, Method, ModuleBuilder, ReadResult, ReadValue,
    ScriptVm,
};

pub const TENSOR_MODULE: &str = "lab.system.tensor";

/// Register `lab.system.tensor` with `ByteTensor` and `DoubleTensor`
/// constructors.
pub fn install(vm: &ScriptVm) {
    vm.add_native_module(TENSOR_MODULE, |lua| {
        let module = ModuleBuilder::new(lua)?;
        module.function("ByteTensor", construct::<u8>)?;
        module.function("DoubleTensor", construct::<f64>)?;
        Ok(module.finish())
    });
}

impl<E: Element> LuaClass for Tensor<E> {
    const CLASS_NAME: &'static str = E::CLASS_NAME;

    fn methods() -> Vec<(&'static str, Method<Self>)> {
        vec![
            ("shape", shape::<E> as Method<Self>),
            ("size", size::<E> as Method<Self>),
            ("isContiguous", is_contiguous::<E> as Method<Self>),
            ("clone", clone::<E> as Method<Self>),
            ("reshape", reshape::<E> as Method<Self>),
            ("select", select::<E> as Method<Self>),
            ("narrow", narrow::<E> as Method<Self>),
            ("transpose", transpose::<E> as Method<Self>),
            ("fill", fill::<E> as Method<Self>),
            ("val", val::<E> as Method<Self>),
        ]
    }

    fn describe(&self) -> String {
        format!("{}{:?}", E::CLASS_NAME, self.shape())
    }
}

/// Reads a live tensor of this element type as a view sharing its storage.
impl<'lua, E: Element> ReadValue<'lua> for Tensor<E> {
    const EXPECTED: &'static str = E::CLASS_NAME;

    fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        match ClassBinding::<Tensor<E>>::read(&value) {
            ReadResult::Found(userdata) => {
                match ClassBinding::<Tensor<E>>::with(&userdata, Tensor::clone) {
                    Some(tensor) => ReadResult::Found(tensor),
                    None => ReadResult::TypeMismatch,
                }
            }
            ReadResult::NotFound => ReadResult::NotFound,
            ReadResult::TypeMismatch => ReadResult::TypeMismatch,
        }
    }
}

fn fail<E: Element>(method: &str, reason: impl Display) -> LuaError {
    raise(format!("[{}.{method}] - {reason}", E::CLASS_NAME))
}

/// Script-facing text of a tensor error, with 1-based positions.
fn describe_error(err: TensorError) -> String {
    match err {
        TensorError::DimOutOfRange { dim, dims } => {
            format!("dimension {} out of range for {dims} dimensions", dim + 1)
        }
        TensorError::IndexOutOfRange { dim, index, size } => format!(
            "index {} out of range for dimension {} of size {size}",
            index + 1,
            dim + 1
        ),
        other => other.to_string(),
    }
}

fn wrap<'lua, E: Element>(lua: &'lua Lua, tensor: Tensor<E>) -> LuaResult<MultiValue<'lua>> {
    ClassBinding::create(lua, tensor)?.into_lua_multi(lua)
}

/// 1-based script position converted to a 0-based index.
fn position<E: Element>(method: &str, args: &[Value], slot: usize, what: &str) -> LuaResult<usize> {
    let value = args.get(slot).unwrap_or(&Value::Nil);
    match integral(value) {
        Some(n) if n >= 1 => Ok(n as usize - 1),
        _ => Err(fail::<E>(method, format!("{what} must be a positive integer"))),
    }
}

fn sizes<E: Element>(method: &str, args: &[Value]) -> LuaResult<Vec<usize>> {
    let values: Vec<Value> = match args {
        [Value::Table(table)] => table
            .clone()
            .sequence_values::<Value>()
            .collect::<LuaResult<_>>()?,
        _ => args.to_vec(),
    };
    values
        .iter()
        .map(|value| match integral(value) {
            Some(n) if n >= 0 => Ok(n as usize),
            _ => Err(fail::<E>(method, "sizes must be non-negative integers")),
        })
        .collect()
}

fn construct<'lua, E: Element>(lua: &'lua Lua, args: Vec<Value<'lua>>) -> LuaResult<MultiValue<'lua>> {
    let tensor = match args.as_slice() {
        [value @ Value::Table(_)] => {
            let (shape, data) =
                flatten::<E>(value).map_err(|reason| fail::<E>("new", reason))?;
            Tensor::from_vec(shape, data)
        }
        [] => Tensor::zeros(vec![0]),
        dims => Tensor::zeros(sizes::<E>("new", dims)?),
    }
    .map_err(|err| fail::<E>("new", describe_error(err)))?;
    wrap(lua, tensor)
}

/// Shape and row-major elements of a nested table of numbers.
fn flatten<E: Element>(value: &Value) -> Result<(Vec<usize>, Vec<E>), String> {
    match value {
        Value::Table(table) => {
            let mut shape = None;
            let mut data = Vec::new();
            let len = table.raw_len();
            for index in 1..=len {
                let child: Value = table.raw_get(index).map_err(|err| err.to_string())?;
                let (child_shape, child_data) = flatten::<E>(&child)?;
                match &shape {
                    None => shape = Some(child_shape),
                    Some(expected) if *expected != child_shape => {
                        return Err("nested tables must be rectangular".to_string())
                    }
                    Some(_) => {}
                }
                data.extend(child_data);
            }
            let mut full = vec![len];
            full.extend(shape.unwrap_or_default());
            Ok((full, data))
        }
        other => {
            let Some(value) = number(other) else {
                return Err(format!("elements must be numbers, got {}", other.type_name()));
            };
            let element =
                E::from_number(value).ok_or_else(|| format!("{value} is not a valid element"))?;
            Ok((Vec::new(), vec![element]))
        }
    }
}

fn nested<'lua, E: Element>(lua: &'lua Lua, shape: &[usize], data: &[E]) -> LuaResult<Value<'lua>> {
    let Some((&outer, inner)) = shape.split_first() else {
        return data.first().map_or(Ok(Value::Nil), |value| value.to_number().into_lua(lua));
    };
    let table = lua.create_table_with_capacity(outer, 0)?;
    let stride: usize = inner.iter().product();
    for index in 0..outer {
        let chunk = &data[index * stride..(index + 1) * stride];
        table.raw_set(index + 1, nested(lua, inner, chunk)?)?;
    }
    Ok(Value::Table(table))
}

fn shape<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    _: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    lua.create_sequence_from(tensor.shape().iter().copied())?
        .into_lua_multi(lua)
}

fn size<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    _: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    tensor.num_elements().into_lua_multi(lua)
}

fn is_contiguous<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    _: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    tensor.is_contiguous().into_lua_multi(lua)
}

fn clone<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    _: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    wrap(lua, tensor.clone_contiguous())
}

fn reshape<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let shape = sizes::<E>("reshape", &args.into_vec())?;
    let view = tensor
        .reshape(shape)
        .map_err(|err| fail::<E>("reshape", describe_error(err)))?;
    wrap(lua, view)
}

fn select<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let args = args.into_vec();
    let dim = position::<E>("select", &args, 0, "dim")?;
    let index = position::<E>("select", &args, 1, "index")?;
    let view = tensor
        .select(dim, index)
        .map_err(|err| fail::<E>("select", describe_error(err)))?;
    wrap(lua, view)
}

fn narrow<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let args = args.into_vec();
    let dim = position::<E>("narrow", &args, 0, "dim")?;
    let start = position::<E>("narrow", &args, 1, "start")?;
    let length = match args.get(2).and_then(integral) {
        Some(n) if n >= 0 => n as usize,
        _ => return Err(fail::<E>("narrow", "length must be a non-negative integer")),
    };
    let size = tensor.shape().get(dim).copied().ok_or_else(|| {
        fail::<E>(
            "narrow",
            describe_error(TensorError::DimOutOfRange {
                dim,
                dims: tensor.shape().len(),
            }),
        )
    })?;
    if start + length > size {
        return Err(fail::<E>(
            "narrow",
            format!(
                "range {}..{} out of bounds for dimension {} of size {size}",
                start + 1,
                start + length,
                dim + 1
            ),
        ));
    }
    let view = tensor
        .narrow(dim, start, length)
        .map_err(|err| fail::<E>("narrow", describe_error(err)))?;
    wrap(lua, view)
}

fn transpose<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let args = args.into_vec();
    let first = position::<E>("transpose", &args, 0, "dim1")?;
    let second = position::<E>("transpose", &args, 1, "dim2")?;
    let view = tensor
        .transpose(first, second)
        .map_err(|err| fail::<E>("transpose", describe_error(err)))?;
    wrap(lua, view)
}

fn fill<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let value = args
        .into_vec()
        .first()
        .and_then(number)
        .and_then(E::from_number)
        .ok_or_else(|| fail::<E>("fill", "value must be a valid element"))?;
    tensor
        .fill(value)
        .map_err(|err| fail::<E>("fill", describe_error(err)))?;
    ().into_lua_multi(lua)
}

/// `val()` returns the elements as nested tables; `val(table)` assigns them.
fn val<'lua, E: Element>(
    tensor: &mut Tensor<E>,
    lua: &'lua Lua,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let args = args.into_vec();
    match args.first() {
        None | Some(Value::Nil) => nested(lua, tensor.shape(), &tensor.to_vec())?.into_lua_multi(lua),
        Some(value) => {
            let (shape, data) = flatten::<E>(value).map_err(|reason| fail::<E>("val", reason))?;
            if data.len() != tensor.num_elements() {
                return Err(fail::<E>(
                    "val",
                    format!(
                        "expected {} elements, got {} (shape {shape:?})",
                        tensor.num_elements(),
                        data.len()
                    ),
                ));
            }
            tensor
                .assign(&data)
                .map_err(|err| fail::<E>("val", describe_error(err)))?;
            ().into_lua_multi(lua)
        }
    }
}
