//! Small shared helpers used by the binary and the long-running components.

pub mod bootstrap;
pub mod retry;
