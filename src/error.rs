use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChaosnetError {
    #[error("invalid disruption: {}", .0.join("; "))]
    InvalidSpec(Vec<String>),

    #[error("network namespace error: {0}")]
    Namespace(String),

    #[error("traffic control error: {0}")]
    Driver(String),

    #[error("kubernetes API error: {0}")]
    ClusterApi(String),

    #[error("host lookup error: {0}")]
    Lookup(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChaosnetError {
    /// True for the apiserver conflict raised when an object changed between
    /// read and write; safe to retry against the latest version.
    pub fn is_transient_conflict(&self) -> bool {
        matches!(self, ChaosnetError::ClusterApi(msg)
            if msg.contains("please apply your changes to the latest version and try again"))
    }
}

pub type Result<T> = std::result::Result<T, ChaosnetError>;
