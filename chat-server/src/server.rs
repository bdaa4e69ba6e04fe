//! 聊天服务器核心实现
//!
//! 每个连接由一个协议驱动任务和一个处理任务组成。处理任务消费连接事件，
//! 把收到的消息广播给其他已就绪的连接，转发格式为 `<identity>: <text>`。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chat_protocol::{
    Connection, ConnectionEvent, EngineConfig, ProtocolError, TcpListener, TcpTransport,
    TransportListener, MAX_CONNECTIONS,
};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, error, info, warn};

/// 默认本地问候语
pub const DEFAULT_GREETING: &str = "server";

/// 单连接事件通道容量
const EVENT_CHANNEL_SIZE: usize = 64;

/// 单连接待转发消息上限
const OUTBOX_SIZE: usize = 256;

/// 广播消息类型
#[derive(Clone, Debug)]
pub enum BroadcastMsg {
    /// 聊天消息
    Chat {
        /// 发送方连接 ID，转发时跳过自己
        from: u64,
        identity: String,
        text: String,
    },
    /// 服务器关闭
    Shutdown,
}

/// 共享状态
struct SharedState {
    /// 已完成握手的连接: connection id -> identity
    users: RwLock<HashMap<u64, String>>,
    /// 当前连接数
    connection_count: AtomicU32,
    /// 下一个连接 ID
    next_id: AtomicU64,
}

impl SharedState {
    fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            connection_count: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// 增加连接数，如果超过限制则返回 false
    fn try_add_connection(&self) -> bool {
        loop {
            let current = self.connection_count.load(Ordering::SeqCst);
            if current >= MAX_CONNECTIONS as u32 {
                return false;
            }
            if self
                .connection_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// 减少连接数
    fn remove_connection(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 登记握手完成的连接
    async fn add_user(&self, id: u64, identity: String) {
        self.users.write().await.insert(id, identity);
    }

    /// 移除用户
    async fn remove_user(&self, id: u64) -> Option<String> {
        self.users.write().await.remove(&id)
    }

    /// 已就绪用户数
    async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// 获取当前连接数
    fn online_count(&self) -> u32 {
        self.connection_count.load(Ordering::SeqCst)
    }
}

/// 聊天服务器
pub struct ChatServer {
    state: Arc<SharedState>,
    broadcast_tx: broadcast::Sender<BroadcastMsg>,
    /// 关闭信号发送端
    shutdown_tx: watch::Sender<bool>,
    /// 关闭信号接收端（用于克隆给客户端处理器）
    shutdown_rx: watch::Receiver<bool>,
    config: EngineConfig,
    greeting: String,
}

impl ChatServer {
    pub fn new(config: EngineConfig, greeting: impl Into<String>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            state: Arc::new(SharedState::new()),
            broadcast_tx,
            shutdown_tx,
            shutdown_rx,
            config,
            greeting: greeting.into(),
        }
    }

    /// 绑定地址并运行服务器
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// 在已绑定的监听器上运行（支持 graceful shutdown）
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                // 接受新连接
                result = listener.accept() => {
                    match result {
                        Ok(transport) => self.spawn_client(transport),
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                // 监听 Ctrl+C 信号
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, initiating graceful shutdown...");
                    self.shutdown().await;
                    break;
                }
            }
        }

        Ok(())
    }

    fn spawn_client(&self, transport: TcpTransport) {
        // 检查连接数限制
        if !self.state.try_add_connection() {
            warn!("Connection limit reached, rejecting new connection");
            return;
        }

        let id = self.state.allocate_id();
        let client = ClientContext {
            id,
            config: self.config.clone(),
            greeting: self.greeting.clone(),
            state: Arc::clone(&self.state),
            broadcast_tx: self.broadcast_tx.clone(),
        };
        let broadcast_rx = self.broadcast_tx.subscribe();
        let shutdown_rx = self.shutdown_rx.clone();
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            if let Err(e) = handle_client(transport, client, broadcast_rx, shutdown_rx).await {
                debug!("Client handler error: {}", e);
            }
            state.remove_connection();
        });
    }

    /// 执行 graceful shutdown
    async fn shutdown(&self) {
        let _ = self.broadcast_tx.send(BroadcastMsg::Shutdown);

        // 发送关闭信号
        let _ = self.shutdown_tx.send(true);

        // 等待所有连接断开（最多等待 5 秒）
        let start = std::time::Instant::now();
        let timeout_duration = Duration::from_secs(5);

        while self.state.online_count() > 0 {
            if start.elapsed() > timeout_duration {
                warn!(
                    "Shutdown timeout, {} connections still active",
                    self.state.online_count()
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("Server shutdown complete");
    }
}

impl Default for ChatServer {
    fn default() -> Self {
        Self::new(EngineConfig::default(), DEFAULT_GREETING)
    }
}

/// 单个连接处理器需要的上下文
struct ClientContext {
    id: u64,
    config: EngineConfig,
    greeting: String,
    state: Arc<SharedState>,
    broadcast_tx: broadcast::Sender<BroadcastMsg>,
}

/// 处理单个客户端连接
async fn handle_client(
    transport: TcpTransport,
    client: ClientContext,
    mut broadcast_rx: broadcast::Receiver<BroadcastMsg>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (connection, handle) =
        Connection::new(transport, &client.config, client.greeting.clone(), events_tx)?;
    let peer = handle.peer_addr();
    let mut driver = tokio::spawn(connection.run());

    // 转发任务串行写出，处理器本身不等待写入结果
    let (outbox_tx, mut outbox_rx) = mpsc::channel::<String>(OUTBOX_SIZE);
    let relay_handle = handle.clone();
    let relay = tokio::spawn(async move {
        while let Some(text) = outbox_rx.recv().await {
            match relay_handle.send_message(text).await {
                Ok(()) => {}
                Err(ProtocolError::ConnectionClosed) => break,
                Err(e) => debug!("Failed to relay to {}: {}", relay_handle.peer_addr(), e),
            }
        }
    });

    let mut identity: Option<String> = None;
    let mut broadcast_open = true;

    let result = loop {
        tokio::select! {
            biased;

            result = &mut driver => break result,

            Some(event) = events.recv() => {
                match event {
                    ConnectionEvent::Ready { identity: ready } => {
                        client.state.add_user(client.id, ready.clone()).await;
                        info!(
                            "User {} (id={}) joined, {} online",
                            ready,
                            client.id,
                            client.state.user_count().await
                        );
                        identity = Some(ready);
                    }
                    ConnectionEvent::Message { identity: from, text } => {
                        debug!("User {} sent: {}", from, text);
                        let _ = client.broadcast_tx.send(BroadcastMsg::Chat {
                            from: client.id,
                            identity: from,
                            text,
                        });
                    }
                }
            }

            result = broadcast_rx.recv(), if broadcast_open => {
                match result {
                    Ok(BroadcastMsg::Chat { from, identity: sender, text }) => {
                        if from != client.id && identity.is_some() {
                            let line = format!("{}: {}", sender, text);
                            if outbox_tx.try_send(line).is_err() {
                                warn!("Outbox full for {}, dropping message", peer);
                            }
                        }
                    }
                    Ok(BroadcastMsg::Shutdown) => {
                        info!("Shutdown signal received, closing connection for {}", peer);
                        handle.close().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Connection {} lagged {} messages", peer, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        broadcast_open = false;
                        handle.close().await;
                    }
                }
            }

            // 监听 shutdown 信号
            Ok(()) = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    handle.close().await;
                }
            }
        }
    };

    drop(outbox_tx);
    let _ = relay.await;

    // 清理用户
    if let Some(identity) = client.state.remove_user(client.id).await {
        info!("User {} left", identity);
    }

    match result {
        Ok(Ok(())) => debug!("Connection {} finished", peer),
        Ok(Err(e)) => debug!("Connection {} aborted: {}", peer, e),
        Err(e) => error!("Connection task for {} failed: {}", peer, e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn start_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = ChatServer::default();
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    async fn join(addr: std::net::SocketAddr, name: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let greeting = format!("GREETING {} {}", name.len(), name);
        stream.write_all(greeting.as_bytes()).await.unwrap();

        let mut buf = [0u8; 17];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GREETING 6 server");
        stream
    }

    #[tokio::test]
    async fn test_relay_to_other_connections() {
        let addr = start_server().await;
        let mut alice = join(addr, "alice").await;
        let mut bob = join(addr, "bob").await;

        alice.write_all(b"MESSAGE 2 hi").await.unwrap();

        let expected = format!("alice@{}: hi", alice.local_addr().unwrap());
        let frame = format!("MESSAGE {} {}", expected.len(), expected);
        let mut buf = vec![0u8; frame.len()];
        bob.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, frame.as_bytes());

        // 不回发给发送方
        let mut extra = [0u8; 1];
        let echoed =
            tokio::time::timeout(Duration::from_millis(100), alice.read(&mut extra)).await;
        assert!(echoed.is_err());
    }

    #[tokio::test]
    async fn test_protocol_violation_closes_connection() {
        let addr = start_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"HELLO 2 hi").await.unwrap();

        // 服务端直接中止，不回任何字节
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let state = SharedState::new();
        for _ in 0..MAX_CONNECTIONS {
            assert!(state.try_add_connection());
        }
        assert!(!state.try_add_connection());

        state.remove_connection();
        assert!(state.try_add_connection());
    }

    #[tokio::test]
    async fn test_user_registry() {
        let state = SharedState::new();
        let id = state.allocate_id();
        state.add_user(id, "alice@127.0.0.1:1".to_string()).await;
        assert_eq!(state.user_count().await, 1);
        assert_eq!(state.remove_user(id).await.as_deref(), Some("alice@127.0.0.1:1"));
        assert_eq!(state.remove_user(id).await, None);
    }
}
