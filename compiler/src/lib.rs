// dlc — Deployment Lowering Compiler
//
// Library root. Tracks buffers and their lifetimes in a compilation context,
// tiles kernels onto memory levels, and assembles per-operation code through
// an ordered pipeline of code transformation passes.

pub mod block;
pub mod buffer;
pub mod closure;
pub mod config;
pub mod context;
pub mod diag;
pub mod future;
pub mod introspect;
pub mod memory;
pub mod pass;
pub mod pipeline;
pub mod template;
pub mod tiling;
pub mod types;
