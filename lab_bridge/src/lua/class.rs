use std::marker::PhantomData;

use mlua::{
    AnyUserData, Lua, MultiValue, Result as LuaResult, UserData, UserDataMethods, Value,
};
use thiserror::Error;

use super::{raise, ReadResult};

/// Native method bound into a script class. The receiver has already been
/// validated; `args` holds everything after it.
pub type Method<T> =
    for<'lua> fn(&mut T, &'lua Lua, MultiValue<'lua>) -> LuaResult<MultiValue<'lua>>;

/// A native type exposed to scripts through [`ClassBinding`].
pub trait LuaClass: Sized + 'static {
    const CLASS_NAME: &'static str;

    fn methods() -> Vec<(&'static str, Method<Self>)>;

    /// Domain check run before every method call, on top of the type check.
    fn is_valid(&self) -> bool {
        true
    }

    fn describe(&self) -> String {
        Self::CLASS_NAME.to_string()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("[{class}.{method}] - First argument must be an object of type '{class}'; received {received}")]
    WrongType {
        class: &'static str,
        method: &'static str,
        received: String,
    },
    #[error("[{class}.{method}] - Trying to access invalidated object of type '{class}'")]
    Invalidated {
        class: &'static str,
        method: &'static str,
    },
    #[error("[{class}.{method}] - Method must be called with ':' instead of '.'")]
    DotCall {
        class: &'static str,
        method: &'static str,
    },
}

/// Script-owned storage for one instance. `None` once finalized.
pub struct ClassInstance<T> {
    object: Option<T>,
}

impl<T: LuaClass> UserData for ClassInstance<T> {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        for (name, method) in T::methods() {
            methods.add_function(name, move |lua, args: MultiValue| {
                dispatch::<T>(lua, name, method, args)
            });
        }
        methods.add_meta_method("__tostring", |_, this, ()| {
            Ok(match &this.object {
                Some(object) if object.is_valid() => object.describe(),
                _ => format!("{} (invalidated)", T::CLASS_NAME),
            })
        });
    }
}

fn dispatch<'lua, T: LuaClass>(
    lua: &'lua Lua,
    method_name: &'static str,
    method: Method<T>,
    args: MultiValue<'lua>,
) -> LuaResult<MultiValue<'lua>> {
    let mut args = args.into_vec();
    let receiver = if args.is_empty() {
        Value::Nil
    } else {
        args.remove(0)
    };

    let userdata = match receiver {
        Value::UserData(userdata) if userdata.is::<ClassInstance<T>>() => userdata,
        other => {
            let dot_call = other.is_nil() || args.iter().any(is_instance::<T>);
            let err = if dot_call {
                DispatchError::DotCall {
                    class: T::CLASS_NAME,
                    method: method_name,
                }
            } else {
                DispatchError::WrongType {
                    class: T::CLASS_NAME,
                    method: method_name,
                    received: other.type_name().to_string(),
                }
            };
            return Err(raise(err.to_string()));
        }
    };

    let mut instance = userdata.borrow_mut::<ClassInstance<T>>()?;
    match instance.object.as_mut() {
        Some(object) if object.is_valid() => method(object, lua, MultiValue::from_vec(args)),
        _ => Err(raise(
            DispatchError::Invalidated {
                class: T::CLASS_NAME,
                method: method_name,
            }
            .to_string(),
        )),
    }
}

fn is_instance<T: LuaClass>(value: &Value) -> bool {
    matches!(value, Value::UserData(userdata) if userdata.is::<ClassInstance<T>>())
}

/// Entry points for creating and inspecting script instances of `T`.
pub struct ClassBinding<T>(PhantomData<T>);

impl<T: LuaClass> ClassBinding<T> {
    pub fn create(lua: &Lua, object: T) -> LuaResult<AnyUserData<'_>> {
        lua.create_userdata(ClassInstance {
            object: Some(object),
        })
    }

    /// Userdata holding a `T`, live or not.
    pub fn read<'lua>(value: &Value<'lua>) -> ReadResult<AnyUserData<'lua>> {
        match value {
            Value::Nil => ReadResult::NotFound,
            Value::UserData(userdata) if userdata.is::<ClassInstance<T>>() => {
                ReadResult::Found(userdata.clone())
            }
            _ => ReadResult::TypeMismatch,
        }
    }

    pub fn is_live(userdata: &AnyUserData) -> bool {
        Self::with(userdata, |_| ()).is_some()
    }

    /// Run `f` on the live, valid object behind `userdata`.
    pub fn with<R>(userdata: &AnyUserData, f: impl FnOnce(&T) -> R) -> Option<R> {
        let instance = userdata.borrow::<ClassInstance<T>>().ok()?;
        match &instance.object {
            Some(object) if object.is_valid() => Some(f(object)),
            _ => None,
        }
    }

    pub fn with_mut<R>(userdata: &AnyUserData, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut instance = userdata.borrow_mut::<ClassInstance<T>>().ok()?;
        match instance.object.as_mut() {
            Some(object) if object.is_valid() => Some(f(object)),
            _ => None,
        }
    }

    /// Run the native destructor now. Later method calls report the
    /// instance as invalidated. Returns whether an object was dropped.
    pub fn finalize(userdata: &AnyUserData) -> bool {
        match userdata.borrow_mut::<ClassInstance<T>>() {
            Ok(mut instance) => instance.object.take().is_some(),
            Err(_) => false,
        }
    }
}
