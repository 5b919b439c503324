pub mod core;
pub mod execution;
pub mod types;

pub use self::core::Cpu;
pub use execution::{EnvCall, Step};
pub use types::{AccessKind, Fault, Trap};
