use std::io;
use std::path::PathBuf;

use lab_wire::WireError;
use thiserror::Error;

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The level script broke its side of the protocol.
    #[error("[{api}] - {reason}")]
    Contract { api: String, reason: String },
    /// The level script raised an error.
    #[error("[{api}] - {message}")]
    Script { api: String, message: String },
    #[error("failed to read level script {}", path.display())]
    LevelNotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid setting {key}={value}: {reason}")]
    InvalidSetting {
        key: String,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Lua(#[from] mlua::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl BridgeError {
    pub fn contract(api: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Contract {
            api: api.into(),
            reason: reason.into(),
        }
    }

    pub fn script(api: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            api: api.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_errors_carry_api_prefix() {
        let err = BridgeError::contract("customDiscreteActions", "missing applier");
        assert_eq!(err.to_string(), "[customDiscreteActions] - missing applier");
    }
}
