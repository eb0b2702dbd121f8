//! WebAssembly sandbox.
//!
//! Untrusted job artifacts run inside a wasmtime store with no ambient
//! filesystem or network capability, a fuel quota derived from the CPU-time
//! budget, and an epoch-based wall-clock deadline.

mod executor;

pub use executor::{ExecutionBudget, SandboxExecutor};
