//! 帧编解码
//!
//! 帧格式（全部为 ASCII 控制令牌，空格分隔）:
//! ```text
//! ┌──────────┬───┬──────────────┬───┬───────────────────────┐
//! │   TYPE   │ ␠ │ LENGTH (十进制) │ ␠ │  PAYLOAD (LENGTH 字节) │
//! └──────────┴───┴──────────────┴───┴───────────────────────┘
//! ```
//!
//! 没有帧结束符，解码器必须精确统计字节数。解码是可恢复的扫描过程：
//! 数据不足时返回 `Ok(None)`，下次有新字节时从中断处继续。

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, FrameKind};
use crate::{MAX_BUFFER_SIZE, SEPARATOR};

/// 解码中间状态，一帧完成时整体重置
#[derive(Debug, Default)]
struct DecodeState {
    /// 当前令牌的累积字节
    scan: Vec<u8>,
    /// 已解析的帧类型
    kind: Option<FrameKind>,
    /// 已解析的载荷长度，仅在 `kind` 有值时有意义
    length: Option<usize>,
}

impl DecodeState {
    fn in_progress(&self) -> bool {
        self.kind.is_some() || !self.scan.is_empty()
    }
}

/// 帧编解码器
#[derive(Debug)]
pub struct FrameCodec {
    max_buffer_size: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// 使用默认缓冲区上限创建编解码器
    pub fn new() -> Self {
        Self::with_max_buffer_size(MAX_BUFFER_SIZE)
    }

    pub fn with_max_buffer_size(max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            state: DecodeState::default(),
        }
    }

    /// 当前帧是否读到一半（令牌或载荷未完整）
    pub fn in_progress(&self) -> bool {
        self.state.in_progress()
    }

    /// 已解析出帧头但载荷尚未读完的帧类型
    #[cfg(test)]
    fn pending_kind(&self) -> Option<FrameKind> {
        self.state.kind
    }

    /// 仅解析帧类型令牌
    ///
    /// 已有待处理帧类型时直接返回它；令牌不完整时返回 `Ok(None)`。
    pub fn decode_kind(&mut self, src: &mut BytesMut) -> Result<Option<FrameKind>> {
        if let Some(kind) = self.state.kind {
            return Ok(Some(kind));
        }

        let Some(token) = self.scan_token(src)? else {
            return Ok(None);
        };

        match FrameKind::from_token(&token) {
            Some(kind) => {
                self.state.kind = Some(kind);
                Ok(Some(kind))
            }
            None => Err(ProtocolError::UnknownFrameType(
                String::from_utf8_lossy(&token).into_owned(),
            )),
        }
    }

    /// 编码一帧并返回独立的字节块
    pub fn encode_to_bytes(&mut self, frame: Frame) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    fn decode_length(&mut self, src: &mut BytesMut) -> Result<Option<usize>> {
        if let Some(length) = self.state.length {
            return Ok(Some(length));
        }

        let Some(mut token) = self.scan_token(src)? else {
            return Ok(None);
        };
        token.pop();

        let length = parse_length(&token)?;
        if length > self.max_buffer_size {
            return Err(ProtocolError::BufferOverflow {
                size: length,
                max: self.max_buffer_size,
            });
        }

        self.state.length = Some(length);
        Ok(Some(length))
    }

    /// 累积字节直到分隔符，返回含分隔符的完整令牌
    fn scan_token(&mut self, src: &mut BytesMut) -> Result<Option<Vec<u8>>> {
        if src.is_empty() {
            return Ok(None);
        }

        let room = self.max_buffer_size.saturating_sub(self.state.scan.len());
        let window = src.len().min(room);

        if let Some(pos) = src[..window].iter().position(|&b| b == SEPARATOR) {
            let token = src.split_to(pos + 1);
            self.state.scan.extend_from_slice(&token);
            return Ok(Some(std::mem::take(&mut self.state.scan)));
        }

        // 没有分隔符且已填满上限，继续累积必然越界
        if src.len() >= room {
            return Err(ProtocolError::BufferOverflow {
                size: self.state.scan.len() + src.len(),
                max: self.max_buffer_size,
            });
        }

        let chunk = src.split();
        self.state.scan.extend_from_slice(&chunk);
        Ok(None)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// 只接受纯十进制数字，不允许符号和空令牌
fn parse_length(token: &[u8]) -> Result<usize> {
    let invalid = || ProtocolError::InvalidLength(String::from_utf8_lossy(token).into_owned());

    if token.is_empty() || !token.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }

    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(invalid)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some(kind) = self.decode_kind(src)? else {
            return Ok(None);
        };
        let Some(length) = self.decode_length(src)? else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length).freeze();
        self.state = DecodeState::default();
        Ok(Some(Frame { kind, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }

        if self.state.in_progress() || !src.is_empty() {
            return Err(ProtocolError::Truncated {
                expected: self.state.length,
                received: self.state.scan.len() + src.len(),
            });
        }

        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_buffer_size {
            return Err(ProtocolError::BufferOverflow {
                size: frame.payload.len(),
                max: self.max_buffer_size,
            });
        }

        let token = frame.kind.token();
        let length = frame.payload.len().to_string();

        dst.reserve(token.len() + length.len() + 1 + frame.payload.len());
        dst.extend_from_slice(token);
        dst.extend_from_slice(length.as_bytes());
        dst.put_u8(SEPARATOR);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
