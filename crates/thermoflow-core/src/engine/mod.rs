//! # Engine Module
//!
//! The stateful layer that turns batches of jobs into scheduled, cached and
//! budgeted work.
//!
//! ## Overview
//!
//! A submission is validated, expanded into per-ensemble requests, and
//! scheduled into a task graph while the cache is locked. Every request
//! reserves the blocks and strands it reads, so tables already filled by an
//! earlier submission are reused instead of recomputed. The graph is then
//! launched on a worker pool and the caller receives a [`runtime::ComputeFuture`].
//!
//! ## Architecture
//!
//! - **Cache** ([`cache`]) - Content-addressed tables with time-ordered eviction
//! - **Decomposition** ([`decompose`]) - Sub-block dependencies of a complex
//! - **Scheduling** (`schedule`, `graph`) - Rounds, incremental eviction, and the task graph
//! - **Execution** (`fill`, `pipeline`) - Work item bodies and result finalizers
//! - **Runtime** ([`runtime`]) - The public [`runtime::Engine`], futures and sinks
//! - **Configuration** ([`config`]) - Budget, worker pool and cache policy
//! - **Error Handling** ([`error`], [`shared_error`]) - Error types and the first-error-wins channel
//! - **Progress Monitoring** ([`progress`]) - Phase and task reporting

pub mod cache;
pub mod config;
pub mod decompose;
pub mod error;
pub(crate) mod fill;
pub(crate) mod graph;
pub(crate) mod pipeline;
pub mod progress;
pub mod runtime;
pub(crate) mod schedule;
pub mod shared_error;
