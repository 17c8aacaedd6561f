//! # thermoflow
//!
//! An incremental, cache-aware compute engine for decomposed
//! dynamic-programming analyses of nucleic-acid complexes.
//!
//! ## Architectural Philosophy
//!
//! - **[`core`]: The Foundation.** Stateless models (`Strand`, `Complex`,
//!   `Job`, results), the [`Kernel`](core::kernel::Kernel) trait through which
//!   the numeric recursions are plugged in, and pair-matrix finalization.
//!
//! - **[`engine`]: The Logic Core.** The content-addressed cache, dependency
//!   decomposition, the task-graph scheduler with incremental eviction, and
//!   the runtime that executes batches and merges their results.
//!
//! - **[`kernels`]: Implementations.** A deterministic synthetic kernel used
//!   by the command-line tool and by tests.
//!
//! - **[`workflows`]: The Public API.** One-call analyses of a single
//!   complex for callers that do not need batching.

pub mod core;
pub mod engine;
pub mod kernels;
pub mod workflows;
