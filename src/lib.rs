//! Scratch-register mediation for dynamic binary instrumentation.
//!
//! When several instrumentation components (tracers, sanitizers, profilers)
//! each want scratch registers while a basic block of application code is
//! being rewritten, they collide: two components pick the same register, or
//! forget to put the application's value back, or clobber the arithmetic
//! flags.  This crate arbitrates.  It runs a backward liveness analysis over
//! each block, hands out registers preferring ones that are dead anyway, and
//! spills and restores lazily.  Because a fault can land anywhere in the
//! generated code, it can also walk the emitted spill/restore sequences to
//! rebuild the application's register state in a machine context.
//!
//! The host framework (block iteration, instruction decoding, raw TLS
//! primitives) is abstracted behind the traits in [`interface`]; emitted code
//! is returned as concrete [`CodeInst`](interface::CodeInst) items that the
//! host lowers to machine instructions.

mod aflags;
mod data_structures;
mod emit;
mod insert;
mod liveness;
mod reserve;
mod restore;
mod slots;

pub mod interface;

pub use crate::interface::*;

#[cfg(test)]
mod tests;
