use std::fmt;

/// 信息回调上报的连接生命周期状态。
///
/// 文案保持稳定，便于日志检索；`Write` 的文案沿用历史拼写 `Steam`，
/// 下游已有按该字符串过滤的告警规则。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// 客户端开始拨号。
    Dial,
    /// 新连接或新关联已建立。
    New,
    /// 即将从连接读取。
    Read,
    /// 读方向已关闭。
    CloseRead,
    /// 即将调用应用 Handler。
    Handler,
    /// 即将向连接写入。
    Write,
    /// 写方向已关闭。
    CloseWrite,
    /// 连接已彻底关闭。
    Close,
}

impl ConnState {
    /// 稳定文案。
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnState::Dial => "Dial Connection",
            ConnState::New => "New Connection",
            ConnState::Read => "Read Incoming Stream",
            ConnState::CloseRead => "Close Incoming Stream",
            ConnState::Handler => "Run Handler",
            ConnState::Write => "Write Outgoing Steam",
            ConnState::CloseWrite => "Close Outgoing Stream",
            ConnState::Close => "Close Connection",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnState;

    #[test]
    fn labels_are_stable() {
        assert_eq!(ConnState::Dial.to_string(), "Dial Connection");
        assert_eq!(ConnState::Write.to_string(), "Write Outgoing Steam");
        assert_eq!(ConnState::Close.as_str(), "Close Connection");
    }
}
