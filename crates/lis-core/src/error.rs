//! 错误定义模块

use thiserror::Error;

/// LIS系统统一错误类型
#[derive(Error, Debug)]
pub enum LisError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("传输错误: {0}")]
    Transport(#[from] std::io::Error),

    #[error("解码错误: {0}")]
    Decode(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("投递错误: {0}")]
    Delivery(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },

    #[error("系统内部错误: {0}")]
    Internal(String),
}

/// LIS系统统一结果类型
pub type Result<T> = std::result::Result<T, LisError>;
