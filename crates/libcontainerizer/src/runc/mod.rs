//! Driver that runs containers through the runc command line.

pub mod binary;
mod events;
pub mod manager;
pub mod process;
mod runner;
pub mod runtime;
pub mod stats;

pub use binary::{RuncBinary, DEFAULT_RUNC_BINARY, DEFAULT_RUNC_ROOT};
pub use manager::RuncContainerManager;
pub use process::RuncProcessManager;
pub use runtime::RuncRuntime;
pub use stats::RuncStatser;
