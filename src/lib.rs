//! Code-cache manager for a dynamic binary translator.
//!
//! Tracks compiled basic blocks of a guest instruction stream, serves a fast
//! address→block dispatch path for the execution loop, links blocks straight
//! into each other to skip the central dispatcher, and tears blocks down when
//! the guest modifies its own code.
//!
//! The code generator, the address translator and the profiler are external
//! collaborators reached through the traits in [`backend`], [`translate`]
//! and [`profiler`]; the cache itself never touches emitted machine code.
//! Designed for exclusive access by a single execution context: every
//! operation is synchronous and bounded by the number of affected blocks.

pub mod backend;
pub mod bitmap;
pub mod block;
pub mod cache;
pub mod config;
pub mod profiler;
pub mod translate;
