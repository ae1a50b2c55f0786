// Re-export from common crate to keep crate::util::* paths stable
pub use pulseboard_common::config;
pub use pulseboard_common::paths;
