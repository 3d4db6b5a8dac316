pub mod config;
pub mod types;
pub mod chain_adapter;
pub mod peers;
pub mod tx;
pub mod transfer;
pub mod scheduler;

pub use config::Config;
pub use types::{Direction, Message, GlueResult, TxReceipt};
pub use transfer::{TransferEngine, TransferOutcome};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Chain error: {0}")]
    Chain(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 链上协议违规：计数器非法、仲裁失败、PostMessageError 等
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Process error: {0}")]
    Process(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Queue(e.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Process(e.to_string())
    }
}

/// 当前 Unix 时间戳（秒）
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
