mod builder;
mod file;

pub use builder::{Batch, build_batch};
