use mlua::Error as LuaError;

/// Replacement text for errors raised with an empty message. An empty string
/// would be indistinguishable from "no error" once it crosses the boundary.
pub const EMPTY_ERROR_MESSAGE: &str = "(empty error message)";

/// Outcome of a call into the script: either the number of values it left on
/// the VM stack or the error it raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultOrError {
    Count(usize),
    Error(String),
}

impl ResultOrError {
    pub fn count(count: usize) -> Self {
        Self::Count(count)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(normalize(message.into()))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Count(_))
    }

    pub fn n_results(&self) -> Option<usize> {
        match self {
            Self::Count(count) => Some(*count),
            Self::Error(_) => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Count(_) => None,
            Self::Error(message) => Some(message),
        }
    }

    pub fn into_result(self) -> Result<usize, String> {
        match self {
            Self::Count(count) => Ok(count),
            Self::Error(message) => Err(message),
        }
    }
}

impl From<LuaError> for ResultOrError {
    fn from(err: LuaError) -> Self {
        Self::error(error_message(&err))
    }
}

/// Message of a Lua error as the script author wrote it, without the
/// callback frames mlua wraps around errors raised by native functions.
pub fn error_message(err: &LuaError) -> String {
    match err {
        LuaError::CallbackError { cause, .. } => error_message(cause),
        LuaError::RuntimeError(message) => message.clone(),
        LuaError::SyntaxError { message, .. } => message.clone(),
        LuaError::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// Error handed back to the interpreter by a native function.
pub fn raise(message: impl Into<String>) -> LuaError {
    LuaError::RuntimeError(normalize(message.into()))
}

fn normalize(message: String) -> String {
    if message.is_empty() {
        EMPTY_ERROR_MESSAGE.to_string()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn empty_error_is_replaced_with_sentinel() {
        let result = ResultOrError::error("");
        assert_eq!(result.error_message(), Some(EMPTY_ERROR_MESSAGE));
        assert!(!result.is_ok());
        assert_eq!(result.n_results(), None);
    }

    #[test]
    fn count_and_message_are_exclusive() {
        let ok = ResultOrError::count(2);
        assert_eq!(ok.n_results(), Some(2));
        assert_eq!(ok.error_message(), None);
        assert_eq!(ok.into_result(), Ok(2));
    }

    #[test]
    fn callback_frames_are_unwrapped() {
        let err = LuaError::CallbackError {
            traceback: "stack traceback:".to_string(),
            cause: Arc::new(LuaError::RuntimeError("[api] - broken".to_string())),
        };
        assert_eq!(error_message(&err), "[api] - broken");
        assert_eq!(
            ResultOrError::from(err),
            ResultOrError::Error("[api] - broken".to_string())
        );
    }
}
