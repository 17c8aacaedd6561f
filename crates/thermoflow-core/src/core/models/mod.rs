pub mod action;
pub mod complex;
pub mod job;
pub mod result;
