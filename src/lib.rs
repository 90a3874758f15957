pub mod cluster;
pub mod config;
pub mod error;
pub mod raft;

pub use cluster::{Cluster, ClusterStatus};
pub use config::RaftConfig;
pub use error::{RaftError, Result};
