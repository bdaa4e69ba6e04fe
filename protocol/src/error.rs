//! 错误类型定义

use thiserror::Error;

use crate::frame::FrameKind;

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 未知帧类型
    #[error("Unknown frame type: {0:?}")]
    UnknownFrameType(String),

    /// 令牌或载荷超出扫描缓冲区上限
    #[error("Buffer overflow: {size} bytes (max: {max})")]
    BufferOverflow { size: usize, max: usize },

    /// 长度字段格式错误
    #[error("Invalid length token: {0:?}")]
    InvalidLength(String),

    /// 连接在帧中途关闭
    #[error("Truncated frame: expected {expected:?} payload bytes, got {received}")]
    Truncated {
        /// 已声明的载荷长度，帧头未读完时为 None
        expected: Option<usize>,
        received: usize,
    },

    /// 握手完成前收到非 GREETING 帧
    #[error("Unexpected {actual} frame before handshake")]
    UnexpectedFrame { actual: FrameKind },

    /// 帧读取无进展超时
    #[error("No progress on current frame within timeout")]
    ProgressTimeout,

    /// 对端存活超时
    #[error("No ping/pong from peer within liveness timeout")]
    LivenessTimeout,

    /// 写入不完整
    #[error("Write error: {0}")]
    WriteError(std::io::Error),

    /// 握手尚未完成
    #[error("Connection is not ready")]
    NotReady,

    /// 空消息
    #[error("Refusing to send empty message")]
    EmptyMessage,

    /// 配置项无效
    #[error("Invalid config {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
