//! cgroup plumbing needed after a container has been created: the v1
//! `memory.use_hierarchy` switch and hand-applied v2 resources for the
//! reserved init child cgroup.
#[cfg(test)]
#[macro_use]
extern crate quickcheck;


pub mod common;
pub mod resources;
pub mod v1;
pub mod v2;
