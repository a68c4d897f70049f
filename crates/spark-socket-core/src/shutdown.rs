use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShutdownDirection {
    /// 关闭读方向：不再接收对端数据。
    Read,
    /// 关闭写方向：向对端发送 EOF。
    Write,
    /// 同时关闭读写。
    Both,
}

/// 一条连接两个方向的关闭状态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以一个带标签的状态替代“读已关闭”“写已关闭”两个独立布尔值，
///   让“两侧都关闭才取消共享上下文”收敛为一次可测试的状态迁移；
/// - 报文传输没有半关闭，任一方向关闭都直接迁移到 `BothClosed`，由调用方以
///   [`ShutdownDirection::Both`] 表达。
///
/// ## 契约（What）
/// - 状态只会单调前进：`Open → ReadClosed | WriteClosed → BothClosed`；
/// - [`HalfCloseState::after`] 为纯函数，原子版本 [`AtomicHalfClose`] 以 CAS 循环调用它。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HalfCloseState {
    Open = 0,
    ReadClosed = 1,
    WriteClosed = 2,
    BothClosed = 3,
}

impl HalfCloseState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => HalfCloseState::Open,
            1 => HalfCloseState::ReadClosed,
            2 => HalfCloseState::WriteClosed,
            _ => HalfCloseState::BothClosed,
        }
    }

    /// 关闭某个方向后的状态。
    pub const fn after(self, direction: ShutdownDirection) -> Self {
        match (self, direction) {
            (HalfCloseState::BothClosed, _) | (_, ShutdownDirection::Both) => {
                HalfCloseState::BothClosed
            }
            (HalfCloseState::Open, ShutdownDirection::Read) => HalfCloseState::ReadClosed,
            (HalfCloseState::Open, ShutdownDirection::Write) => HalfCloseState::WriteClosed,
            (HalfCloseState::ReadClosed, ShutdownDirection::Read) => HalfCloseState::ReadClosed,
            (HalfCloseState::WriteClosed, ShutdownDirection::Write) => HalfCloseState::WriteClosed,
            (HalfCloseState::ReadClosed, ShutdownDirection::Write)
            | (HalfCloseState::WriteClosed, ShutdownDirection::Read) => HalfCloseState::BothClosed,
        }
    }

    /// 读方向是否已关闭。
    pub const fn read_closed(self) -> bool {
        matches!(self, HalfCloseState::ReadClosed | HalfCloseState::BothClosed)
    }

    /// 写方向是否已关闭。
    pub const fn write_closed(self) -> bool {
        matches!(self, HalfCloseState::WriteClosed | HalfCloseState::BothClosed)
    }

    /// 指定方向是否已关闭；`Both` 要求两侧都关闭。
    pub const fn is_closed(self, direction: ShutdownDirection) -> bool {
        match direction {
            ShutdownDirection::Read => self.read_closed(),
            ShutdownDirection::Write => self.write_closed(),
            ShutdownDirection::Both => matches!(self, HalfCloseState::BothClosed),
        }
    }
}

impl fmt::Display for HalfCloseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HalfCloseState::Open => "open",
            HalfCloseState::ReadClosed => "read-closed",
            HalfCloseState::WriteClosed => "write-closed",
            HalfCloseState::BothClosed => "closed",
        };
        f.write_str(text)
    }
}

/// 一次关闭操作的迁移结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HalfCloseTransition {
    pub previous: HalfCloseState,
    pub current: HalfCloseState,
}

impl HalfCloseTransition {
    /// 本次调用是否真正关闭了 `direction`（此前未关闭、此后已关闭）。
    pub const fn closed_now(&self, direction: ShutdownDirection) -> bool {
        match direction {
            ShutdownDirection::Read => {
                !self.previous.read_closed() && self.current.read_closed()
            }
            ShutdownDirection::Write => {
                !self.previous.write_closed() && self.current.write_closed()
            }
            ShutdownDirection::Both => !matches!(self.previous, HalfCloseState::BothClosed),
        }
    }

    /// 本次调用是否使连接进入 `BothClosed`；每条连接只有一次调用会得到 `true`。
    pub const fn became_fully_closed(&self) -> bool {
        !matches!(self.previous, HalfCloseState::BothClosed)
            && matches!(self.current, HalfCloseState::BothClosed)
    }
}

/// [`HalfCloseState`] 的原子容器。
pub struct AtomicHalfClose {
    state: AtomicU8,
}

impl AtomicHalfClose {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(HalfCloseState::Open as u8),
        }
    }

    pub fn load(&self) -> HalfCloseState {
        HalfCloseState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// 关闭一个方向并返回迁移结果。
    pub fn close(&self, direction: ShutdownDirection) -> HalfCloseTransition {
        let mut observed = self.state.load(Ordering::Acquire);
        loop {
            let previous = HalfCloseState::from_u8(observed);
            let current = previous.after(direction);
            if current == previous {
                return HalfCloseTransition { previous, current };
            }
            match self.state.compare_exchange_weak(
                observed,
                current as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return HalfCloseTransition { previous, current },
                Err(actual) => observed = actual,
            }
        }
    }
}

impl Default for AtomicHalfClose {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AtomicHalfClose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicHalfClose").field(&self.load()).finish()
    }
}
