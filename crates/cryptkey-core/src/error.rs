//! Error type shared by the keyscript and its collaborators.
//!
//! Only a failed interactive prompt is fatal to an unlock attempt. Everything on the
//! keyfile path is reported through `RetrievalOutcome` instead, so these variants mostly
//! travel between a collaborator and the component that logs and downgrades them.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type CryptkeyResult<T> = Result<T, CryptkeyError>;

#[derive(Debug, Error)]
pub enum CryptkeyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("mount failed: {0}")]
    Mount(String),

    #[error("unmount failed: {0}")]
    Unmount(String),

    #[error("password prompt failed: {0}")]
    Prompt(String),

    #[error("module loader failed: {0}")]
    Module(String),
}

impl From<toml::de::Error> for CryptkeyError {
    fn from(err: toml::de::Error) -> Self {
        CryptkeyError::ConfigParse(err.to_string())
    }
}

impl From<serde_yaml::Error> for CryptkeyError {
    fn from(err: serde_yaml::Error) -> Self {
        CryptkeyError::ConfigParse(err.to_string())
    }
}
