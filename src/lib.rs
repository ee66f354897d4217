//! Umbrella crate: re-exports the translator-core workspace members.
//!
//! The pipeline runs decoder (external) -> [`ir`] block -> x87 lowering
//! ([`ir::passes::x87stack`]) -> [`interp`] (or a JIT backend validated
//! against it).

pub use oxbow_cpu as cpu;
pub use oxbow_interp as interp;
pub use oxbow_ir as ir;
pub use oxbow_perf as perf;
pub use oxbow_softfloat as softfloat;
pub use oxbow_types as types;
