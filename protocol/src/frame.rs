//! 帧类型定义

use std::fmt;

use bytes::Bytes;

use crate::KEEPALIVE_PAYLOAD;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// 心跳请求
    Ping,
    /// 心跳响应
    Pong,
    /// 聊天消息
    Message,
    /// 握手问候
    Greeting,
}

impl FrameKind {
    /// 线上类型令牌，包含结尾分隔符
    pub fn token(self) -> &'static [u8] {
        match self {
            FrameKind::Ping => b"PING ",
            FrameKind::Pong => b"PONG ",
            FrameKind::Message => b"MESSAGE ",
            FrameKind::Greeting => b"GREETING ",
        }
    }

    /// 按完整令牌（含结尾分隔符）识别帧类型，大小写敏感
    pub fn from_token(token: &[u8]) -> Option<Self> {
        match token {
            b"PING " => Some(FrameKind::Ping),
            b"PONG " => Some(FrameKind::Pong),
            b"MESSAGE " => Some(FrameKind::Message),
            b"GREETING " => Some(FrameKind::Greeting),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameKind::Ping => "PING",
            FrameKind::Pong => "PONG",
            FrameKind::Message => "MESSAGE",
            FrameKind::Greeting => "GREETING",
        };
        f.write_str(name)
    }
}

/// 一个完整的线上帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// 聊天消息帧
    pub fn message(text: &str) -> Self {
        Self::new(FrameKind::Message, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// 握手帧
    pub fn greeting(text: &str) -> Self {
        Self::new(FrameKind::Greeting, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, Bytes::from_static(KEEPALIVE_PAYLOAD))
    }

    pub fn pong() -> Self {
        Self::new(FrameKind::Pong, Bytes::from_static(KEEPALIVE_PAYLOAD))
    }

    /// 载荷按 UTF-8 解码，非法序列替换为 U+FFFD
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
