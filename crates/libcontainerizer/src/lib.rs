#[cfg(test)]
#[macro_use]
extern crate mockall;

pub mod backing_process;
pub mod bundle;
pub mod cgroup_manager;
pub mod container_manager;
pub mod containerd;
pub mod containerizer;
pub mod deleter;
pub mod depot;
pub mod error;
pub mod io;
pub mod metrics;
pub mod pid;
pub mod process;
pub mod process_builder;
pub mod runc;
pub mod signal;
pub mod user;
