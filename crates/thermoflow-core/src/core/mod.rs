//! # Core Module
//!
//! Stateless building blocks shared by the engine and by kernel
//! implementations.
//!
//! - **Models** ([`models`]) - strands, complexes, jobs, results and action overrides
//! - **Kernel boundary** ([`kernel`]) - the trait through which dynamic-programming
//!   recursions are plugged into the engine, together with the views they receive
//! - **Pair matrices** ([`pairs`]) - assembly and normalization of pair probability
//!   and pair cost matrices from per-block slices

pub mod kernel;
pub mod models;
pub mod pairs;
