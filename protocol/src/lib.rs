//! 聊天室共享协议库
//!
//! 文本长度前缀协议，每帧形如 `TYPE LENGTH PAYLOAD`，例如 `MESSAGE 2 hi`。
//!
//! 包含:
//! - 帧类型定义 (Frame, FrameKind)
//! - 帧编解码 (FrameCodec)
//! - 心跳与超时控制 (Keepalive)
//! - 连接状态机 (ConnectionEngine)
//! - 传输层抽象 (Transport trait)
//! - 连接驱动 (Connection, ConnectionHandle)

mod frame;
mod constants;
mod config;
mod codec;
mod keepalive;
mod engine;
mod transport;
mod connection;
mod error;

pub use frame::{Frame, FrameKind};
pub use constants::*;
pub use config::EngineConfig;
pub use codec::FrameCodec;
pub use keepalive::{Keepalive, TimerPurpose};
pub use engine::{ConnectionEngine, ConnectionEvent, ConnectionState, EngineAction};
pub use transport::{Transport, TransportListener, TransportConfig, TcpTransport, TcpListener};
pub use connection::{Connection, ConnectionHandle};
pub use error::{ProtocolError, Result};
