//! 连接封装
//!
//! 把传输层读写端与 [`ConnectionEngine`] 组合起来，在单个任务里驱动：
//! 读到字节交给引擎，按引擎给出的最早截止时间休眠，执行引擎返回的动作。
//! 出站字节和待投递事件先进入队列，由同一个 `select!` 循环逐步写出，
//! 对端不读或上层不收时，读取、截止时间和命令照常处理。
//! 上层通过 [`ConnectionHandle`] 发送消息，通过事件通道接收
//! [`ConnectionEvent`]。

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{ConnectionEngine, ConnectionEvent, EngineAction};
use crate::error::{ProtocolError, Result};
use crate::transport::Transport;

/// 每次读取前预留的缓冲区大小
const READ_CHUNK: usize = 4096;

/// 命令通道容量
const COMMAND_CHANNEL_SIZE: usize = 32;

/// 待投递事件达到此数量时暂停读取
const MAX_PENDING_EVENTS: usize = 32;

/// 句柄发给连接任务的命令
#[derive(Debug)]
enum Command {
    /// 发送聊天消息，写入结果通过 reply 返回
    Send {
        text: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// 关闭连接
    Close,
}

/// 连接句柄，可克隆，连接任务结束后所有操作返回 `ConnectionClosed`
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    peer: SocketAddr,
    commands: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// 发送聊天消息，字节全部写入传输层后返回
    ///
    /// 空消息、握手未完成、出站队列已满或写入失败都会返回错误。
    pub async fn send_message(&self, text: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        rx.await.map_err(|_| ProtocolError::ConnectionClosed)?
    }

    /// 请求关闭连接
    pub async fn close(&self) {
        let _ = self.commands.send(Command::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// 出站队列
///
/// 按累计字节偏移记录每条消息的结束位置，写到该位置时回复发送方。
#[derive(Debug)]
struct Outbound {
    buf: BytesMut,
    limit: usize,
    queued: u64,
    written: u64,
    waiters: VecDeque<(u64, oneshot::Sender<Result<()>>)>,
    needs_flush: bool,
    failed: bool,
}

impl Outbound {
    fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
            queued: 0,
            written: 0,
            waiters: VecDeque::new(),
            needs_flush: false,
            failed: false,
        }
    }

    /// 追加字节，返回写完这些字节时的累计偏移
    fn push(&mut self, bytes: &[u8]) -> Result<u64> {
        if self.failed {
            return Err(ProtocolError::WriteError(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport write side failed",
            )));
        }
        if self.buf.len() + bytes.len() > self.limit {
            return Err(ProtocolError::WriteError(io::Error::new(
                io::ErrorKind::WouldBlock,
                "outbound queue full",
            )));
        }
        self.buf.extend_from_slice(bytes);
        self.queued += bytes.len() as u64;
        Ok(self.queued)
    }

    fn has_work(&self) -> bool {
        !self.failed && (!self.buf.is_empty() || self.needs_flush)
    }

    /// `write_buf` 已经推进了 `buf`，这里只更新偏移并回复写完的消息
    fn advance(&mut self, n: usize) {
        self.written += n as u64;
        self.needs_flush = true;
        while let Some((end, _)) = self.waiters.front() {
            if *end > self.written {
                break;
            }
            if let Some((_, reply)) = self.waiters.pop_front() {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn fail(&mut self, err: &io::Error) {
        self.failed = true;
        self.buf.clear();
        for (_, reply) in self.waiters.drain(..) {
            let _ = reply.send(Err(ProtocolError::WriteError(io::Error::new(
                err.kind(),
                err.to_string(),
            ))));
        }
    }
}

/// 写出一部分待写字节；队列已空时执行 flush，返回 `None`
///
/// 只做一次 `write_buf` 或一次 flush，在 `select!` 中被取消不会丢字节。
async fn write_some<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &mut BytesMut,
) -> io::Result<Option<usize>> {
    if buf.is_empty() {
        writer.flush().await?;
        return Ok(None);
    }
    match writer.write_buf(buf).await? {
        0 => Err(io::ErrorKind::WriteZero.into()),
        n => Ok(Some(n)),
    }
}

/// 连接驱动
///
/// # Type Parameters
/// * `R` - 读取端类型
/// * `W` - 写入端类型
pub struct Connection<R, W> {
    reader: R,
    writer: W,
    engine: ConnectionEngine,
    buffer: BytesMut,
    outbound: Outbound,
    events: mpsc::Sender<ConnectionEvent>,
    pending_events: VecDeque<ConnectionEvent>,
    commands: mpsc::Receiver<Command>,
    /// 结束时投递剩余事件、写出剩余字节的最长等待时间
    linger: Duration,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Connection<R, W> {
    /// 从传输层创建连接
    ///
    /// 取不到对端地址说明连接已失效，直接返回错误。
    pub fn new<T: Transport<Reader = R, Writer = W>>(
        transport: T,
        config: &EngineConfig,
        greeting: impl Into<String>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<(Self, ConnectionHandle)> {
        let peer = transport.peer_addr()?;
        let (reader, writer) = transport.split();
        Ok(Self::from_parts(reader, writer, peer, config, greeting, events))
    }

    /// 从读写端直接创建连接
    pub fn from_parts(
        reader: R,
        writer: W,
        peer: SocketAddr,
        config: &EngineConfig,
        greeting: impl Into<String>,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let connection = Self {
            reader,
            writer,
            engine: ConnectionEngine::new(config, greeting, peer, Instant::now()),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            outbound: Outbound::new(config.max_buffer_size.saturating_mul(4)),
            events,
            pending_events: VecDeque::new(),
            commands: commands_rx,
            linger: config.transfer_timeout,
        };
        let handle = ConnectionHandle {
            peer,
            commands: commands_tx,
        };
        (connection, handle)
    }

    /// 主动连接的一方在 [`run`](Self::run) 之前调用，排队本地 GREETING
    pub fn greet(&mut self) -> Result<()> {
        if let Some(greeting) = self.engine.initiate()? {
            self.outbound.push(&greeting)?;
        }
        Ok(())
    }

    /// 运行直到连接结束
    ///
    /// 在帧边界正常关闭返回 `Ok(())`，否则返回导致中止的错误。
    pub async fn run(mut self) -> Result<()> {
        let peer = self.engine.peer_addr();
        let result = self.drive().await;

        self.engine.close();
        self.wind_down(result.is_ok()).await;

        match &result {
            Ok(()) => info!("Connection {} closed", peer),
            Err(e) => warn!("Aborting connection {}: {}", peer, e),
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let mut commands_open = true;

        loop {
            let deadline = self.engine.next_deadline();
            let reading = self.pending_events.len() < MAX_PENDING_EVENTS;
            let writing = self.outbound.has_work();
            let delivering = !self.pending_events.is_empty();
            if reading {
                self.buffer.reserve(READ_CHUNK);
            }
            let events = self.events.clone();

            tokio::select! {
                read = self.reader.read_buf(&mut self.buffer), if reading => {
                    if read? == 0 {
                        return self.engine.finish(&mut self.buffer);
                    }
                    let actions = self.engine.receive(&mut self.buffer, Instant::now())?;
                    self.apply(actions);
                }

                _ = sleep_until_deadline(deadline) => {
                    let actions = self.engine.poll_timers(Instant::now())?;
                    self.apply(actions);
                }

                written = write_some(&mut self.writer, &mut self.outbound.buf), if writing => {
                    match written {
                        Ok(Some(n)) => self.outbound.advance(n),
                        Ok(None) => self.outbound.needs_flush = false,
                        // 写端失效不单独中止，随后的读取会发现传输层断开
                        Err(e) => {
                            warn!("Failed to write to {}: {}", self.engine.peer_addr(), e);
                            self.outbound.fail(&e);
                        }
                    }
                }

                permit = events.reserve(), if delivering => {
                    match permit {
                        Ok(permit) => {
                            if let Some(event) = self.pending_events.pop_front() {
                                permit.send(event);
                            }
                        }
                        Err(_) => {
                            debug!("Event receiver dropped for {}", self.engine.peer_addr());
                            self.pending_events.clear();
                        }
                    }
                }

                command = self.commands.recv(), if commands_open => {
                    match command {
                        Some(Command::Send { text, reply }) => self.send_message(&text, reply),
                        Some(Command::Close) => {
                            debug!("Close requested for {}", self.engine.peer_addr());
                            return Ok(());
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
    }

    fn apply(&mut self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Send(bytes) => {
                    if let Err(e) = self.outbound.push(&bytes) {
                        warn!("Failed to queue frame for {}: {}", self.engine.peer_addr(), e);
                    }
                }
                EngineAction::Emit(event) => {
                    if !self.events.is_closed() {
                        self.pending_events.push_back(event);
                    }
                }
            }
        }
    }

    fn send_message(&mut self, text: &str, reply: oneshot::Sender<Result<()>>) {
        let queued = self
            .engine
            .send_message(text)
            .and_then(|bytes| self.outbound.push(&bytes));
        match queued {
            Ok(end) => self.outbound.waiters.push_back((end, reply)),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// 正常关闭时投递剩余事件、写出剩余字节；中止时只投递通道放得下的事件
    async fn wind_down(&mut self, graceful: bool) {
        let peer = self.engine.peer_addr();
        let linger = self.linger;

        if !graceful {
            while let Some(event) = self.pending_events.pop_front() {
                if self.events.try_send(event).is_err() {
                    debug!(
                        "Dropping {} undelivered events for {}",
                        self.pending_events.len() + 1,
                        peer
                    );
                    break;
                }
            }
            let _ = timeout(linger, self.writer.shutdown()).await;
            return;
        }

        let remaining = async {
            while let Some(event) = self.pending_events.pop_front() {
                if self.events.send(event).await.is_err() {
                    break;
                }
            }
            if self.outbound.has_work() {
                let written = self.outbound.buf.len();
                if self.writer.write_all_buf(&mut self.outbound.buf).await.is_ok()
                    && self.writer.flush().await.is_ok()
                {
                    self.outbound.advance(written);
                }
            }
            let _ = self.writer.shutdown().await;
        };

        if timeout(linger, remaining).await.is_err() {
            debug!("Gave up flushing connection {}", peer);
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
