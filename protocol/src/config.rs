//! 连接引擎配置

use std::time::Duration;

use crate::error::{ProtocolError, Result};
use crate::{MAX_BUFFER_SIZE, PING_INTERVAL, PONG_TIMEOUT, TRANSFER_TIMEOUT};

/// 连接引擎配置
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// 帧读取无进展超时
    pub transfer_timeout: Duration,
    /// 存活超时，超过此时间未收到 PING/PONG 则断开
    pub pong_timeout: Duration,
    /// PING 发送间隔
    pub ping_interval: Duration,
    /// 扫描缓冲区上限（字节）
    pub max_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer_timeout: TRANSFER_TIMEOUT,
            pong_timeout: PONG_TIMEOUT,
            ping_interval: PING_INTERVAL,
            max_buffer_size: MAX_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    pub const TRANSFER_TIMEOUT_ENV: &'static str = "CHAT_TRANSFER_TIMEOUT_MS";
    pub const PONG_TIMEOUT_ENV: &'static str = "CHAT_PONG_TIMEOUT_MS";
    pub const PING_INTERVAL_ENV: &'static str = "CHAT_PING_INTERVAL_MS";
    pub const MAX_BUFFER_SIZE_ENV: &'static str = "CHAT_MAX_BUFFER_SIZE";

    /// 从环境变量读取配置，未设置的项使用默认值
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 通过任意键值查找函数构造配置
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var(&lookup, Self::TRANSFER_TIMEOUT_ENV)? {
            config.transfer_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, Self::PONG_TIMEOUT_ENV)? {
            config.pong_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, Self::PING_INTERVAL_ENV)? {
            config.ping_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var(&lookup, Self::MAX_BUFFER_SIZE_ENV)? {
            config.max_buffer_size =
                usize::try_from(size).map_err(|_| ProtocolError::InvalidConfig {
                    key: Self::MAX_BUFFER_SIZE_ENV,
                    value: size.to_string(),
                })?;
        }

        Ok(config)
    }
}

/// 取值必须是正整数
fn parse_var<F>(lookup: &F, key: &'static str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(ProtocolError::InvalidConfig { key, value: raw }),
    }
}
