use mlua::{AnyUserData, Function, Lua, Table, Value};

/// Outcome of reading a typed value out of the script world.
///
/// `NotFound` means there was nothing there (nil or an absent key);
/// `TypeMismatch` means something was there but of the wrong kind. Callers
/// that need a value treat both as failure but report them differently.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult<T> {
    Found(T),
    NotFound,
    TypeMismatch,
}

impl<T> ReadResult<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch)
    }

    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadResult<U> {
        match self {
            Self::Found(value) => ReadResult::Found(f(value)),
            Self::NotFound => ReadResult::NotFound,
            Self::TypeMismatch => ReadResult::TypeMismatch,
        }
    }
}

/// Types that can be read from a script value. Nil is always `NotFound`.
pub trait ReadValue<'lua>: Sized {
    /// Name of the expected kind, used in diagnostics.
    const EXPECTED: &'static str;

    fn read_value(lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self>;
}

pub(crate) fn integral(value: &Value) -> Option<i64> {
    match *value {
        Value::Integer(n) => Some(n as i64),
        Value::Number(n) if n.is_finite() && n.fract() == 0.0 => {
            (n >= i64::MIN as f64 && n <= i64::MAX as f64).then_some(n as i64)
        }
        _ => None,
    }
}

pub(crate) fn number(value: &Value) -> Option<f64> {
    match *value {
        Value::Integer(n) => Some(n as f64),
        Value::Number(n) => Some(n),
        _ => None,
    }
}

fn read_with<'lua, T>(
    value: Value<'lua>,
    convert: impl FnOnce(Value<'lua>) -> Option<T>,
) -> ReadResult<T> {
    if value.is_nil() {
        return ReadResult::NotFound;
    }
    match convert(value) {
        Some(found) => ReadResult::Found(found),
        None => ReadResult::TypeMismatch,
    }
}

macro_rules! read_by_match {
    ($ty:ty, $expected:literal, $convert:expr) => {
        impl<'lua> ReadValue<'lua> for $ty {
            const EXPECTED: &'static str = $expected;

            fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
                read_with(value, $convert)
            }
        }
    };
}

read_by_match!(bool, "a boolean", |value| match value {
    Value::Boolean(flag) => Some(flag),
    _ => None,
});

read_by_match!(i64, "an integer", |value| integral(&value));

read_by_match!(i32, "an integer", |value| integral(&value)
    .and_then(|n| i32::try_from(n).ok()));

read_by_match!(usize, "a non-negative integer", |value| integral(&value)
    .and_then(|n| usize::try_from(n).ok()));

read_by_match!(f64, "a number", |value| number(&value));

read_by_match!(String, "a string", |value| match value {
    Value::String(text) => text.to_str().ok().map(str::to_string),
    _ => None,
});

impl<'lua> ReadValue<'lua> for Table<'lua> {
    const EXPECTED: &'static str = "a table";

    fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        read_with(value, |value| match value {
            Value::Table(table) => Some(table),
            _ => None,
        })
    }
}

impl<'lua> ReadValue<'lua> for Function<'lua> {
    const EXPECTED: &'static str = "a function";

    fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        read_with(value, |value| match value {
            Value::Function(function) => Some(function),
            _ => None,
        })
    }
}

impl<'lua> ReadValue<'lua> for AnyUserData<'lua> {
    const EXPECTED: &'static str = "a userdata";

    fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        read_with(value, |value| match value {
            Value::UserData(data) => Some(data),
            _ => None,
        })
    }
}

impl<'lua> ReadValue<'lua> for Value<'lua> {
    const EXPECTED: &'static str = "a value";

    fn read_value(_lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        match value {
            Value::Nil => ReadResult::NotFound,
            other => ReadResult::Found(other),
        }
    }
}

/// Array part of a table, every element of which must read as `T`.
impl<'lua, T: ReadValue<'lua>> ReadValue<'lua> for Vec<T> {
    const EXPECTED: &'static str = "an array";

    fn read_value(lua: &'lua Lua, value: Value<'lua>) -> ReadResult<Self> {
        let table = match value {
            Value::Nil => return ReadResult::NotFound,
            Value::Table(table) => table,
            _ => return ReadResult::TypeMismatch,
        };
        let len = table.raw_len();
        let mut items = Vec::with_capacity(len);
        for index in 1..=len {
            let Ok(element) = table.raw_get::<_, Value>(index) else {
                return ReadResult::TypeMismatch;
            };
            match T::read_value(lua, element) {
                ReadResult::Found(item) => items.push(item),
                _ => return ReadResult::TypeMismatch,
            }
        }
        ReadResult::Found(items)
    }
}
