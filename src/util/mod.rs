//! Small shared helpers used by more than one module.

pub mod digest;
pub mod events;
pub mod hexpath;
