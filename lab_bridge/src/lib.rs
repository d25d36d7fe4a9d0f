pub mod context;
pub mod lua;
pub mod tensor;

mod error;
mod file_system;
mod hooks;

pub use context::{
    ActionSpec, Context, ContextOptions, EngineCalls, Entity, MoveType, Observation,
    ObservationPayload, PickupItem, Settings,
};
pub use error::{BridgeError, Result};
pub use file_system::{FileSystem, HostFileSystem};
pub use hooks::{EngineHooks, STATUS_ERROR, STATUS_OK};
pub use lua::{ResultOrError, ScriptVm, StackScope, ValueHandle};
pub use tensor::Tensor;
