//! 心跳与超时控制
//!
//! 不持有任何计时器，只记录各用途的截止时间，由驱动方按
//! [`Keepalive::next_deadline`] 休眠后调用 [`Keepalive::poll`]。
//!
//! - **Progress**: 读帧过程中等待更多字节时布置，新字节到达即取消
//! - **Ping**: 进入 Ready 后周期性发送 PING，只负责发出
//! - **Liveness**: 自上次收到 PING/PONG 起计时，只负责观察；
//!   超过（而非达到）超时时长才判定对端失效

use std::time::Duration;

use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{ProtocolError, Result};

/// tokio 计时器精度，存活检测在边界之后一个刻度唤醒
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// 截止时间的用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    Progress,
    Ping,
    Liveness,
}

/// 心跳控制器
#[derive(Debug, Clone)]
pub struct Keepalive {
    transfer_timeout: Duration,
    pong_timeout: Duration,
    ping_interval: Duration,
    progress_deadline: Option<Instant>,
    next_ping: Option<Instant>,
    last_pong_at: Option<Instant>,
}

impl Keepalive {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            transfer_timeout: config.transfer_timeout,
            pong_timeout: config.pong_timeout,
            ping_interval: config.ping_interval,
            progress_deadline: None,
            next_ping: None,
            last_pong_at: None,
        }
    }

    /// 布置进展截止时间，覆盖之前的同用途截止时间
    pub fn arm_progress(&mut self, now: Instant) {
        self.progress_deadline = Some(now + self.transfer_timeout);
    }

    pub fn cancel_progress(&mut self) {
        self.progress_deadline = None;
    }

    /// 启动 PING 周期与存活检测
    pub fn start(&mut self, now: Instant) {
        self.next_ping = Some(now + self.ping_interval);
        self.last_pong_at = Some(now);
    }

    pub fn is_running(&self) -> bool {
        self.next_ping.is_some()
    }

    /// 收到 PING 或 PONG
    pub fn record_signal(&mut self, now: Instant) {
        if self.is_running() {
            self.last_pong_at = Some(now);
        }
    }

    pub fn last_pong_at(&self) -> Option<Instant> {
        self.last_pong_at
    }

    /// 各用途的截止时间，存活检测返回的是边界本身
    pub fn deadline(&self, purpose: TimerPurpose) -> Option<Instant> {
        match purpose {
            TimerPurpose::Progress => self.progress_deadline,
            TimerPurpose::Ping => self.next_ping,
            TimerPurpose::Liveness => self.last_pong_at.map(|at| at + self.pong_timeout),
        }
    }

    /// 最早的截止时间，没有任何计时时返回 None
    pub fn next_deadline(&self) -> Option<Instant> {
        [TimerPurpose::Progress, TimerPurpose::Ping, TimerPurpose::Liveness]
            .into_iter()
            .filter_map(|purpose| self.wake_at(purpose))
            .min()
    }

    /// 检查到期的截止时间
    ///
    /// 超时返回错误；PING 到期时返回 `Ok(true)` 并排定下一次。
    pub fn poll(&mut self, now: Instant) -> Result<bool> {
        if self.expired(TimerPurpose::Progress, now) {
            return Err(ProtocolError::ProgressTimeout);
        }
        if self.expired(TimerPurpose::Liveness, now) {
            return Err(ProtocolError::LivenessTimeout);
        }
        if self.expired(TimerPurpose::Ping, now) {
            self.next_ping = Some(now + self.ping_interval);
            return Ok(true);
        }
        Ok(false)
    }

    /// 取消全部截止时间
    pub fn stop(&mut self) {
        self.progress_deadline = None;
        self.next_ping = None;
        self.last_pong_at = None;
    }

    fn wake_at(&self, purpose: TimerPurpose) -> Option<Instant> {
        let deadline = self.deadline(purpose)?;
        match purpose {
            TimerPurpose::Liveness => Some(deadline + TIMER_RESOLUTION),
            TimerPurpose::Progress | TimerPurpose::Ping => Some(deadline),
        }
    }

    fn expired(&self, purpose: TimerPurpose, now: Instant) -> bool {
        self.deadline(purpose).is_some_and(|deadline| match purpose {
            TimerPurpose::Liveness => now > deadline,
            TimerPurpose::Progress | TimerPurpose::Ping => now >= deadline,
        })
    }
}
