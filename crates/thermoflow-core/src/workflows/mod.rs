//! # Workflows Module
//!
//! Single-complex analyses on top of the [`Engine`](crate::engine::runtime::Engine).
//!
//! Each function submits one job, waits for it, and unwraps the one result
//! slot the caller asked for. Batches of mixed jobs should go through the
//! engine directly so that they share one scheduling pass.

pub mod analysis;
