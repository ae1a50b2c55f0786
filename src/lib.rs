pub mod daemon;
pub mod util;

pub use crate::daemon::engine::{Engine, EngineOptions, EngineStatus};
pub use pulseboard_storage as storage;
