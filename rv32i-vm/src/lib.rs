pub mod cpu;
pub mod emulator;
pub mod engine;
pub mod loader;
pub mod memory;
pub mod snapshot;

pub use cpu::{Cpu, Fault, Trap};
pub use emulator::{
    Control, Emulator, EmulatorConfig, EmulatorError, Environment, Exit, Halt,
    HaltOnEnvironmentCall, RunOutcome, State,
};
pub use engine::{Op, Register, decode};
pub use memory::{Bus, Memory};
