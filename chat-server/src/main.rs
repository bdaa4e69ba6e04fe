//! 聊天室服务端
//!
//! 基于 Tokio 的异步 TCP 服务器
//!
//! 用法: `chat-server [ADDR] [GREETING]`，超时与缓冲区上限通过
//! `CHAT_*` 环境变量调整。

mod server;

use anyhow::Result;
use chat_protocol::EngineConfig;
use server::{ChatServer, DEFAULT_GREETING};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:8080";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("chat_server=debug".parse()?)
                .add_directive("chat_protocol=debug".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| DEFAULT_ADDR.to_string());
    let greeting = args.next().unwrap_or_else(|| DEFAULT_GREETING.to_string());
    let config = EngineConfig::from_env()?;

    info!("Chat Server starting on {} as {:?}", addr, greeting);
    info!(
        "transfer timeout {:?}, pong timeout {:?}, ping interval {:?}, buffer {} bytes",
        config.transfer_timeout, config.pong_timeout, config.ping_interval, config.max_buffer_size
    );

    let server = ChatServer::new(config, greeting);
    server.run(&addr).await?;

    Ok(())
}
