//! 聊天客户端核心实现

use anyhow::bail;
use chat_protocol::{
    Connection, ConnectionEvent, EngineConfig, TcpTransport, Transport, TransportConfig,
};
use chrono::{Local, NaiveTime};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 用户名最大长度
pub const MAX_NAME_LEN: usize = 20;

/// 聊天客户端
pub struct ChatClient {
    name: String,
    config: EngineConfig,
    transport: TransportConfig,
}

impl ChatClient {
    pub fn new(name: String) -> anyhow::Result<Self> {
        validate_name(&name)?;
        Ok(Self {
            name,
            config: EngineConfig::from_env()?,
            transport: TransportConfig::default(),
        })
    }

    /// 连接服务器并运行，直到连接结束或标准输入关闭
    pub async fn run(&self, addr: &str) -> anyhow::Result<()> {
        let transport = TcpTransport::connect(addr, &self.transport).await?;
        info!("Connected to {}", addr);

        let (events_tx, mut events) = mpsc::channel(32);
        let (mut connection, handle) =
            Connection::new(transport, &self.config, self.name.clone(), events_tx)?;

        // 主动连接方先发 GREETING
        connection.greet()?;
        let mut driver = tokio::spawn(connection.run());

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;

        loop {
            tokio::select! {
                result = &mut driver => {
                    match result? {
                        Ok(()) => println!("*** connection closed"),
                        Err(e) => println!("*** disconnected: {}", e),
                    }
                    return Ok(());
                }

                Some(event) = events.recv() => {
                    println!("{}", render(&event, Local::now().time()));
                }

                line = lines.next_line(), if stdin_open => {
                    match line? {
                        Some(line) => {
                            let text = line.trim_end();
                            if !text.is_empty() {
                                if let Err(e) = handle.send_message(text).await {
                                    warn!("Failed to send message: {}", e);
                                }
                            }
                        }
                        None => {
                            stdin_open = false;
                            handle.close().await;
                        }
                    }
                }
            }
        }
    }
}

/// 验证用户名格式
pub fn validate_name(name: &str) -> anyhow::Result<()> {
    if name.is_empty() {
        bail!("用户名不能为空");
    }
    if name.len() > MAX_NAME_LEN {
        bail!("用户名不能超过 {} 个字符", MAX_NAME_LEN);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!("用户名只能包含字母、数字、下划线和连字符");
    }
    Ok(())
}

/// 渲染一条事件为终端输出行
fn render(event: &ConnectionEvent, at: NaiveTime) -> String {
    let timestamp = at.format("%H:%M:%S");
    match event {
        ConnectionEvent::Ready { identity } => {
            format!("[{}] *** connected to {}", timestamp, identity)
        }
        ConnectionEvent::Message { text, .. } => format!("[{}] {}", timestamp, text),
    }
}
