use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// 服务端生命周期阶段。
///
/// 迁移顺序：`Idle → Listening → Running → Draining → Stopped`；`Stopped` 之后可再次 `Listen`，
/// `Listening` 失败（绑定/权限修正出错）时直接回到 `Stopped`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerPhase {
    /// 尚未监听，不持有套接字。
    Idle = 0,
    /// 正在创建监听套接字与 Unix 文件。
    Listening = 1,
    /// accept 循环运行中。
    Running = 2,
    /// 已停止接收新连接，存量连接按宽限期收尾。
    Draining = 3,
    /// 全部任务退出，套接字与文件已释放。
    Stopped = 4,
}

impl ServerPhase {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerPhase::Idle,
            1 => ServerPhase::Listening,
            2 => ServerPhase::Running,
            3 => ServerPhase::Draining,
            _ => ServerPhase::Stopped,
        }
    }

    /// 是否处于可被 `Shutdown` 中断的活动阶段。
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            ServerPhase::Listening | ServerPhase::Running | ServerPhase::Draining
        )
    }
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServerPhase::Idle => "idle",
            ServerPhase::Listening => "listening",
            ServerPhase::Running => "running",
            ServerPhase::Draining => "draining",
            ServerPhase::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// [`ServerPhase`] 的原子容器，所有迁移都通过 CAS 完成。
pub struct AtomicServerPhase {
    phase: AtomicU8,
}

impl AtomicServerPhase {
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(ServerPhase::Idle as u8),
        }
    }

    pub fn load(&self) -> ServerPhase {
        ServerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn store(&self, phase: ServerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// 仅当当前阶段为 `from` 时迁移到 `to`。
    pub fn transition(&self, from: ServerPhase, to: ServerPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 从 `Idle` 或 `Stopped` 进入 `Listening`；其它阶段返回当前阶段。
    pub fn begin_listen(&self) -> Result<(), ServerPhase> {
        if self.transition(ServerPhase::Idle, ServerPhase::Listening)
            || self.transition(ServerPhase::Stopped, ServerPhase::Listening)
        {
            return Ok(());
        }
        Err(self.load())
    }

    /// 从 `Running`（或仍在 `Listening`）进入 `Draining`；只有第一个调用者返回 `true`。
    pub fn begin_drain(&self) -> bool {
        self.transition(ServerPhase::Running, ServerPhase::Draining)
            || self.transition(ServerPhase::Listening, ServerPhase::Draining)
    }
}

impl Default for AtomicServerPhase {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicServerPhase").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_only_from_idle_or_stopped() {
        let phase = AtomicServerPhase::new();
        assert!(phase.begin_listen().is_ok());
        assert_eq!(phase.begin_listen(), Err(ServerPhase::Listening));
        assert!(phase.transition(ServerPhase::Listening, ServerPhase::Running));
        assert!(phase.begin_drain());
        assert!(!phase.begin_drain());
        phase.store(ServerPhase::Stopped);
        assert!(phase.begin_listen().is_ok());
    }
}
