//! Cluster-wide error types.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("invalid config for {instance}: {reason}")]
    ConfigInvalid { instance: String, reason: String },

    #[error("directory failure at {}: {reason}", path.display())]
    Directory { path: PathBuf, reason: String },

    #[error("failed to launch {instance}: {reason}")]
    Launch { instance: String, reason: String },

    #[error("cannot tail log of {instance} ({}): {reason}", path.display())]
    Tail {
        instance: String,
        path: PathBuf,
        reason: String,
    },

    #[error("provisioning failed at {step}: {reason}")]
    Provisioning { step: String, reason: String },

    #[error("settings error: {0}")]
    Settings(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    pub fn config(instance: impl Into<String>, reason: impl Into<String>) -> Self {
        ClusterError::ConfigInvalid {
            instance: instance.into(),
            reason: reason.into(),
        }
    }

    pub fn directory(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        ClusterError::Directory {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn provisioning(step: impl Into<String>, reason: impl ToString) -> Self {
        ClusterError::Provisioning {
            step: step.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn config_invalid_names_instance() {
        let e = ClusterError::config("node-0.example.org", "no addresses");
        assert!(e.to_string().contains("node-0.example.org"));
        assert!(e.to_string().contains("no addresses"));
    }

    #[test]
    fn directory_error_shows_path() {
        let e = ClusterError::directory("/tmp/cluster/provider-0", "already exists");
        assert!(e.to_string().contains("/tmp/cluster/provider-0"));
    }

    #[test]
    fn provisioning_error_names_step() {
        let e = ClusterError::provisioning("SET_USER_IDENTITY", "unexpected status 554");
        assert!(e.to_string().contains("SET_USER_IDENTITY"));
        assert!(e.to_string().contains("554"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let e: ClusterError = io_err.into();
        assert!(e.to_string().contains("io error"));
        let _: &dyn Error = &e;
    }
}
