//! Kernels the engine can drive out of the box.

pub mod synthetic;
