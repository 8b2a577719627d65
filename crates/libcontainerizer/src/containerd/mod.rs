//! Driver that runs containers through a containerd daemon.

pub mod client;
pub mod grpc;
pub mod metrics;
pub mod nerd;
pub mod process;
mod protos;
#[cfg(test)]
pub(crate) mod test;

pub use client::{ClientError, DaemonClient};
pub use grpc::{GrpcClient, DEFAULT_CONTAINERD_SOCKET, DEFAULT_NAMESPACE};
pub use metrics::NerdMetrics;
pub use nerd::NerdContainerManager;
pub use process::NerdProcessManager;
