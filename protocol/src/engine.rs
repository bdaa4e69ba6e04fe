//! 连接状态机
//!
//! 引擎本身不做 I/O：调用方把读到的字节和当前时间交给它，
//! 它返回需要执行的动作（写出字节、上报事件）。这样握手、分发与
//! 超时逻辑可以脱离网络直接测试。
//!
//! ```text
//! ┌───────────────────┐ GREETING ┌─────────────────────────┐ payload ┌───────┐
//! │ AwaitingHandshake │─────────>│ ReadingHandshakePayload │────────>│ Ready │
//! └───────────────────┘          └─────────────────────────┘         └───────┘
//!           │ 其他帧/错误/超时               │ 错误/超时                  │ 错误/超时
//!           ↓                                ↓                            ↓
//!                                 连接中止，无恢复路径
//! ```

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, info};

use crate::codec::FrameCodec;
use crate::config::EngineConfig;
use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, FrameKind};
use crate::keepalive::Keepalive;

/// 连接状态，只会前进不会回退
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 等待对端的 GREETING 帧头
    AwaitingHandshake,
    /// 已收到 GREETING 帧头，等待载荷
    ReadingHandshakePayload,
    /// 握手完成，可收发消息
    Ready,
}

/// 上报给上层的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// 握手完成，只触发一次
    Ready { identity: String },
    /// 收到聊天消息
    Message { identity: String, text: String },
}

/// 引擎要求驱动方执行的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAction {
    /// 写出这些字节
    Send(Bytes),
    /// 上报事件
    Emit(ConnectionEvent),
}

/// 单连接协议引擎
#[derive(Debug)]
pub struct ConnectionEngine {
    state: ConnectionState,
    codec: FrameCodec,
    keepalive: Keepalive,
    peer: SocketAddr,
    local_greeting: String,
    /// 握手完成后固定
    identity: String,
    greeting_sent: bool,
    closed: bool,
}

impl ConnectionEngine {
    /// 创建引擎并立即布置进展截止时间
    ///
    /// 对端连上后一直不发 GREETING 也会在传输超时后被断开。
    pub fn new(
        config: &EngineConfig,
        local_greeting: impl Into<String>,
        peer: SocketAddr,
        now: Instant,
    ) -> Self {
        let mut keepalive = Keepalive::new(config);
        keepalive.arm_progress(now);

        Self {
            state: ConnectionState::AwaitingHandshake,
            codec: FrameCodec::with_max_buffer_size(config.max_buffer_size),
            keepalive,
            peer,
            local_greeting: local_greeting.into(),
            identity: String::new(),
            greeting_sent: false,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 握手完成后的身份，形如 `name@ip:port`
    pub fn identity(&self) -> Option<&str> {
        (self.state == ConnectionState::Ready).then_some(self.identity.as_str())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn greeting_sent(&self) -> bool {
        self.greeting_sent
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.keepalive.last_pong_at()
    }

    /// 驱动方应在此时间调用 [`poll_timers`](Self::poll_timers)
    pub fn next_deadline(&self) -> Option<Instant> {
        self.keepalive.next_deadline()
    }

    /// 主动发起连接的一方调用：立即发送本地 GREETING
    ///
    /// 已发送过则返回 `None`，握手完成时也不会再发。
    pub fn initiate(&mut self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        self.greeting_frame()
    }

    /// 处理新到达的字节，消费所有完整的帧
    pub fn receive(&mut self, src: &mut BytesMut, now: Instant) -> Result<Vec<EngineAction>> {
        self.ensure_open()?;
        if !src.is_empty() {
            self.keepalive.cancel_progress();
        }

        let mut actions = Vec::new();
        let result = loop {
            match self.step(src, now, &mut actions) {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.abort_on_error(result)?;

        if self.codec.in_progress() || self.state != ConnectionState::Ready {
            self.keepalive.arm_progress(now);
        }

        Ok(actions)
    }

    /// 处理到期的截止时间
    pub fn poll_timers(&mut self, now: Instant) -> Result<Vec<EngineAction>> {
        self.ensure_open()?;
        let ping_due = self.keepalive.poll(now);
        if self.abort_on_error(ping_due)? {
            debug!("Sending ping to {}", self.peer);
            let ping = self.codec.encode_to_bytes(Frame::ping())?;
            return Ok(vec![EngineAction::Send(ping)]);
        }
        Ok(Vec::new())
    }

    /// 编码一条聊天消息
    pub fn send_message(&mut self, text: &str) -> Result<Bytes> {
        self.ensure_open()?;
        if text.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        if self.state != ConnectionState::Ready {
            return Err(ProtocolError::NotReady);
        }
        self.codec.encode_to_bytes(Frame::message(text))
    }

    /// 传输层读到 EOF
    ///
    /// 完整的帧已由 [`receive`](Self::receive) 消费，剩余字节意味着帧被截断。
    pub fn finish(&mut self, src: &mut BytesMut) -> Result<()> {
        let result = self.codec.decode_eof(src).map(|_| ());
        self.close();
        result
    }

    /// 取消所有截止时间，之后的调用都返回 `ConnectionClosed`
    pub fn close(&mut self) {
        self.keepalive.stop();
        self.closed = true;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.close();
        }
        result
    }

    fn greeting_frame(&mut self) -> Result<Option<Bytes>> {
        if self.greeting_sent {
            return Ok(None);
        }
        let bytes = self
            .codec
            .encode_to_bytes(Frame::greeting(&self.local_greeting))?;
        self.greeting_sent = true;
        Ok(Some(bytes))
    }

    /// 推进一步，没有可处理的完整单元时返回 `Ok(false)`
    fn step(
        &mut self,
        src: &mut BytesMut,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) -> Result<bool> {
        match self.state {
            ConnectionState::AwaitingHandshake => match self.codec.decode_kind(src)? {
                None => Ok(false),
                Some(FrameKind::Greeting) => {
                    self.state = ConnectionState::ReadingHandshakePayload;
                    Ok(true)
                }
                Some(actual) => Err(ProtocolError::UnexpectedFrame { actual }),
            },
            ConnectionState::ReadingHandshakePayload => {
                let Some(frame) = self.codec.decode(src)? else {
                    return Ok(false);
                };
                self.complete_handshake(frame, now, actions)?;
                Ok(true)
            }
            ConnectionState::Ready => {
                let Some(frame) = self.codec.decode(src)? else {
                    return Ok(false);
                };
                self.dispatch(frame, now, actions)?;
                Ok(true)
            }
        }
    }

    fn complete_handshake(
        &mut self,
        frame: Frame,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) -> Result<()> {
        self.identity = format!("{}@{}:{}", frame.text(), self.peer.ip(), self.peer.port());

        if let Some(greeting) = self.greeting_frame()? {
            actions.push(EngineAction::Send(greeting));
        }

        self.keepalive.start(now);
        self.state = ConnectionState::Ready;
        info!("Connection {} ready", self.identity);

        actions.push(EngineAction::Emit(ConnectionEvent::Ready {
            identity: self.identity.clone(),
        }));
        Ok(())
    }

    fn dispatch(
        &mut self,
        frame: Frame,
        now: Instant,
        actions: &mut Vec<EngineAction>,
    ) -> Result<()> {
        match frame.kind {
            FrameKind::Message => {
                let text = frame.text();
                debug!("{} sent {} bytes", self.identity, frame.payload.len());
                actions.push(EngineAction::Emit(ConnectionEvent::Message {
                    identity: self.identity.clone(),
                    text,
                }));
            }
            FrameKind::Ping => {
                self.keepalive.record_signal(now);
                let pong = self.codec.encode_to_bytes(Frame::pong())?;
                actions.push(EngineAction::Send(pong));
            }
            FrameKind::Pong => {
                self.keepalive.record_signal(now);
            }
            FrameKind::Greeting => {
                debug!("Ignoring repeated greeting from {}", self.identity);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn engine(now: Instant) -> ConnectionEngine {
        ConnectionEngine::new(&EngineConfig::default(), "server", peer(), now)
    }

    fn ready_engine(now: Instant) -> ConnectionEngine {
        let mut engine = engine(now);
        engine
            .receive(&mut BytesMut::from(&b"GREETING 5 alice"[..]), now)
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::Ready);
        engine
    }

    fn send(bytes: &[u8]) -> EngineAction {
        EngineAction::Send(Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn test_handshake() {
        let now = Instant::now();
        let mut engine = engine(now);
        assert_eq!(engine.identity(), None);

        let actions = engine
            .receive(&mut BytesMut::from(&b"GREETING 5 alice"[..]), now)
            .unwrap();

        assert_eq!(
            actions,
            vec![
                send(b"GREETING 6 server"),
                EngineAction::Emit(ConnectionEvent::Ready {
                    identity: "alice@127.0.0.1:4000".to_string()
                }),
            ]
        );
        assert_eq!(engine.identity(), Some("alice@127.0.0.1:4000"));
        assert!(engine.greeting_sent());
    }

    #[test]
    fn test_handshake_in_single_bytes() {
        let now = Instant::now();
        let mut engine = engine(now);
        let mut src = BytesMut::new();
        let mut actions = Vec::new();

        for &b in b"GREETING 5 alice".iter() {
            src.extend_from_slice(&[b]);
            actions.extend(engine.receive(&mut src, now).unwrap());
        }

        assert_eq!(actions.len(), 2);
        assert_eq!(engine.state(), ConnectionState::Ready);
    }

    #[test]
    fn test_state_after_greeting_header() {
        let now = Instant::now();
        let mut engine = engine(now);
        engine
            .receive(&mut BytesMut::from(&b"GREETING 5 al"[..]), now)
            .unwrap();
        assert_eq!(engine.state(), ConnectionState::ReadingHandshakePayload);
    }

    #[test]
    fn test_initiator_sends_greeting_once() {
        let now = Instant::now();
        let mut engine = engine(now);

        assert_eq!(
            engine.initiate().unwrap(),
            Some(Bytes::from_static(b"GREETING 6 server"))
        );
        assert_eq!(engine.initiate().unwrap(), None);

        let actions = engine
            .receive(&mut BytesMut::from(&b"GREETING 3 bob"[..]), now)
            .unwrap();
        assert_eq!(
            actions,
            vec![EngineAction::Emit(ConnectionEvent::Ready {
                identity: "bob@127.0.0.1:4000".to_string()
            })]
        );
    }

    #[test]
    fn test_message_before_handshake_aborts() {
        let now = Instant::now();
        let mut engine = engine(now);
        let err = engine
            .receive(&mut BytesMut::from(&b"MESSAGE 2 hi"[..]), now)
            .unwrap_err();

        assert!(matches!(
            err,
            ProtocolError::UnexpectedFrame {
                actual: FrameKind::Message
            }
        ));
        assert!(engine.is_closed());
        assert_eq!(engine.next_deadline(), None);
        assert!(matches!(
            engine.receive(&mut BytesMut::from(&b"GREETING 1 a"[..]), now),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_unknown_type_aborts() {
        let now = Instant::now();
        let mut engine = ready_engine(now);
        let err = engine
            .receive(&mut BytesMut::from(&b"FOO 1 x"[..]), now)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFrameType(_)));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_message_after_handshake() {
        let now = Instant::now();
        let mut engine = ready_engine(now);
        let actions = engine
            .receive(&mut BytesMut::from(&b"MESSAGE 2 hiMESSAGE 5 there"[..]), now)
            .unwrap();

        assert_eq!(
            actions,
            vec![
                EngineAction::Emit(ConnectionEvent::Message {
                    identity: "alice@127.0.0.1:4000".to_string(),
                    text: "hi".to_string(),
                }),
                EngineAction::Emit(ConnectionEvent::Message {
                    identity: "alice@127.0.0.1:4000".to_string(),
                    text: "there".to_string(),
                }),
            ]
        );
    }

    #[test]
    fn test_handshake_and_message_in_one_read() {
        let now = Instant::now();
        let mut engine = engine(now);
        let actions = engine
            .receive(&mut BytesMut::from(&b"GREETING 5 aliceMESSAGE 2 hi"[..]), now)
            .unwrap();
        assert_eq!(actions.len(), 3);
        assert!(matches!(
            &actions[2],
            EngineAction::Emit(ConnectionEvent::Message { text, .. }) if text == "hi"
        ));
    }

    #[test]
    fn test_ping_reflex() {
        let now = Instant::now();
        let mut engine = ready_engine(now);
        let actions = engine
            .receive(&mut BytesMut::from(&b"PING 1 p"[..]), now)
            .unwrap();
        assert_eq!(actions, vec![send(b"PONG 1 p")]);
    }

    #[test]
    fn test_progress_deadline_armed_until_handshake() {
        let t0 = Instant::now();
        let mut engine = engine(t0);
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_secs(30)));

        let err = engine.poll_timers(t0 + Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, ProtocolError::ProgressTimeout));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_progress_deadline_mid_frame() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);

        let t1 = t0 + Duration::from_secs(1);
        engine
            .receive(&mut BytesMut::from(&b"MESSAGE 10 hel"[..]), t1)
            .unwrap();
        assert!(engine.poll_timers(t1 + Duration::from_secs(3)).unwrap().is_empty());

        let t2 = t1 + Duration::from_secs(3);
        engine.receive(&mut BytesMut::from(&b"lo"[..]), t2).unwrap();

        // 新字节到达后截止时间从 t2 重新计算
        assert!(engine.poll_timers(t1 + Duration::from_secs(30)).is_ok());
        let err = engine.poll_timers(t2 + Duration::from_secs(30)).unwrap_err();
        assert!(matches!(err, ProtocolError::ProgressTimeout));
    }

    #[test]
    fn test_no_progress_deadline_at_frame_boundary() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);
        engine
            .receive(&mut BytesMut::from(&b"MESSAGE 2 hi"[..]), t0)
            .unwrap();
        // 只剩 PING 周期
        assert_eq!(engine.next_deadline(), Some(t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_periodic_ping() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);
        let actions = engine.poll_timers(t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(actions, vec![send(b"PING 1 p")]);
        assert!(engine.poll_timers(t0 + Duration::from_secs(6)).unwrap().is_empty());
    }

    #[test]
    fn test_liveness_timeout() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);
        let boundary = t0 + Duration::from_secs(60);
        assert!(engine.poll_timers(boundary).is_ok());
        assert!(!engine.is_closed());

        let err = engine
            .poll_timers(boundary + Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::LivenessTimeout));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_pong_resets_liveness() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);
        let t1 = t0 + Duration::from_secs(59);
        engine
            .receive(&mut BytesMut::from(&b"PONG 1 p"[..]), t1)
            .unwrap();
        assert_eq!(engine.last_pong_at(), Some(t1));
        assert!(engine.poll_timers(t0 + Duration::from_secs(61)).is_ok());
        assert!(engine.poll_timers(t1 + Duration::from_secs(61)).is_err());
    }

    #[test]
    fn test_received_ping_counts_as_liveness() {
        let t0 = Instant::now();
        let mut engine = ready_engine(t0);
        let t1 = t0 + Duration::from_secs(50);
        engine
            .receive(&mut BytesMut::from(&b"PING 1 p"[..]), t1)
            .unwrap();
        assert_eq!(engine.last_pong_at(), Some(t1));
    }

    #[test]
    fn test_send_message() {
        let now = Instant::now();
        let mut engine = engine(now);
        assert!(matches!(engine.send_message("hi"), Err(ProtocolError::NotReady)));

        engine
            .receive(&mut BytesMut::from(&b"GREETING 5 alice"[..]), now)
            .unwrap();
        assert!(matches!(engine.send_message(""), Err(ProtocolError::EmptyMessage)));
        assert_eq!(
            engine.send_message("hi").unwrap(),
            Bytes::from_static(b"MESSAGE 2 hi")
        );
    }

    #[test]
    fn test_finish_truncated() {
        let now = Instant::now();
        let mut engine = ready_engine(now);
        let mut src = BytesMut::from(&b"MESSAGE 10 hello"[..]);
        engine.receive(&mut src, now).unwrap();

        let err = engine.finish(&mut src).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: Some(10),
                received: 5
            }
        ));
        assert!(engine.is_closed());
    }

    #[test]
    fn test_finish_clean() {
        let now = Instant::now();
        let mut engine = ready_engine(now);
        assert!(engine.finish(&mut BytesMut::new()).is_ok());
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn test_buffer_bound_from_config() {
        let now = Instant::now();
        let config = EngineConfig {
            max_buffer_size: 8,
            ..EngineConfig::default()
        };
        let mut engine = ConnectionEngine::new(&config, "server", peer(), now);
        let err = engine
            .receive(&mut BytesMut::from(&b"XXXXXXXXXXXX"[..]), now)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BufferOverflow { max: 8, .. }));
    }
}
