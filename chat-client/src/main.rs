//! 聊天室客户端
//!
//! 终端客户端: `chat-client ADDR NAME`，每行输入作为一条消息发送。

mod client;

use anyhow::{bail, Result};
use client::ChatClient;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chat_client=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(addr), Some(name)) = (args.next(), args.next()) else {
        bail!("usage: chat-client ADDR NAME");
    };

    let client = ChatClient::new(name)?;
    client.run(&addr).await
}
