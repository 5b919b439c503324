pub mod decoder;

pub use decoder::{decode, AluOp, BranchCond, LoadWidth, Op, Register, StoreWidth, Unsupported};
