//! 协议常量定义

use std::time::Duration;

/// 令牌分隔符（ASCII 空格）
pub const SEPARATOR: u8 = b' ';

/// PING/PONG 帧的约定填充载荷
pub const KEEPALIVE_PAYLOAD: &[u8] = b"p";

/// 扫描缓冲区最大字节数（令牌与载荷共用）
pub const MAX_BUFFER_SIZE: usize = 1_024_000;

/// 服务端最大连接数
pub const MAX_CONNECTIONS: usize = 100;

/// 帧传输超时（毫秒）- 帧读取过程中超过此时间没有新字节则断开
pub const TRANSFER_TIMEOUT_MS: u64 = 30 * 1000;

/// 存活超时（毫秒）- 超过此时间未收到 PING/PONG 则断开
pub const PONG_TIMEOUT_MS: u64 = 60 * 1000;

/// PING 发送间隔（毫秒）
pub const PING_INTERVAL_MS: u64 = 5 * 1000;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 帧传输超时 Duration
pub const TRANSFER_TIMEOUT: Duration = Duration::from_millis(TRANSFER_TIMEOUT_MS);

/// 存活超时 Duration
pub const PONG_TIMEOUT: Duration = Duration::from_millis(PONG_TIMEOUT_MS);

/// PING 间隔 Duration
pub const PING_INTERVAL: Duration = Duration::from_millis(PING_INTERVAL_MS);

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
