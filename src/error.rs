use std::io;
use thiserror::Error;

use crate::nat::RuleKind;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad or duplicate input, rejected before touching the kernel.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("only IPv4 subnets are supported: {0}")]
    NotIpv4(String),

    #[error("no available addresses in {0}")]
    PoolExhausted(String),

    /// A device, link or packet-filter operation failed at the OS boundary.
    #[error("kernel apply failed: {0}")]
    KernelApply(String),

    /// Rollback of a port forward failed too; `left` are the rules still installed.
    #[error("port forward partially installed ({left:?} left behind): {reason}")]
    PortForwardIncomplete { reason: String, left: Vec<RuleKind> },

    #[error("external collaborator failed: {0}")]
    External(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn kernel(msg: impl Into<String>) -> Self {
        Self::KernelApply(msg.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
