pub mod assembler;
pub mod coalescer;
pub mod dashboard;
pub mod engine;
pub mod registry;

pub mod server; // HTTP + SSE

pub use pulseboard_core::snapshot;
