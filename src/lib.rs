//! mixcluster: synthesize and run a local mixnet test cluster.
//!
//! Pipeline: [`identity`] keys feed the [`synth::ClusterBuilder`], which
//! produces [`documents`] and wires them with [`topology`] into a frozen
//! [`synth::Cluster`]. The [`orchestrator`] launches it, [`tail`] aggregates
//! the logs and [`management`] provisions mail accounts on running providers.

pub mod config;
pub mod documents;
pub mod error;
pub mod identity;
pub mod logger;
pub mod management;
pub mod orchestrator;
pub mod synth;
pub mod tail;
pub mod topology;

pub use error::ClusterError;
