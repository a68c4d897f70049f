use std::{fmt, io, path::PathBuf, sync::Arc};

use thiserror::Error;

/// 错误分类：决定调用方是否重试、是否中止整个引擎。
///
/// - `Configuration`：缺少 Handler、地址或权限非法，立即失败且不可重试；
/// - `Transient`：单次 accept/read/write 失败，只影响当前连接；
/// - `Instance`：在状态不允许的实例上调用方法（未启动时关停、运行中再次监听）；
/// - `Resource`：Unix 套接字文件权限/属组修正失败，中止 `Listen`；
/// - `Cancelled` / `Timeout`：上下文取消或截止时间到达。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Transient,
    Instance,
    Resource,
    Cancelled,
    Timeout,
}

impl ErrorCategory {
    /// 该类错误是否应当中止整个服务端/客户端引擎。
    pub const fn aborts_engine(self) -> bool {
        matches!(
            self,
            ErrorCategory::Configuration | ErrorCategory::Resource | ErrorCategory::Instance
        )
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

impl OperationKind {
    pub const BIND: OperationKind = OperationKind {
        code: "spark.socket.bind_failed",
        message: "socket bind",
    };
    pub const ACCEPT: OperationKind = OperationKind {
        code: "spark.socket.accept_failed",
        message: "socket accept",
    };
    pub const CONNECT: OperationKind = OperationKind {
        code: "spark.socket.connect_failed",
        message: "socket connect",
    };
    pub const READ: OperationKind = OperationKind {
        code: "spark.socket.read_failed",
        message: "socket read",
    };
    pub const WRITE: OperationKind = OperationKind {
        code: "spark.socket.write_failed",
        message: "socket write",
    };
    pub const SHUTDOWN: OperationKind = OperationKind {
        code: "spark.socket.shutdown_failed",
        message: "socket shutdown",
    };
    pub const HANDSHAKE: OperationKind = OperationKind {
        code: "spark.socket.handshake_failed",
        message: "tls handshake",
    };
    pub const CONFIGURE: OperationKind = OperationKind {
        code: "spark.socket.configure_failed",
        message: "socket configure",
    };
    pub const LISTEN: OperationKind = OperationKind {
        code: "spark.socket.listen_cancelled",
        message: "server listen",
    };
    pub const DRAIN: OperationKind = OperationKind {
        code: "spark.socket.shutdown_wait",
        message: "server shutdown",
    };
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message)
    }
}

/// 对 Unix 套接字文件执行的资源操作。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceAction {
    RemoveStale,
    Chmod,
    Chown,
    Inspect,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ResourceAction::RemoveStale => "remove stale socket file",
            ResourceAction::Chmod => "correct socket file permissions",
            ResourceAction::Chown => "correct socket file group",
            ResourceAction::Inspect => "inspect socket file",
        };
        f.write_str(text)
    }
}

/// 套接字传输层的统一错误。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一个错误既要作为返回值交给触发它的调用方，又要异步投递给错误回调，因此实现 `Clone`，
///   底层 `io::Error` 用 `Arc` 共享；
/// - 每个变体都有稳定的 [`code`](SocketError::code) 与 [`category`](SocketError::category)，
///   方便日志聚合与告警按码过滤。
///
/// ## 契约（What）
/// - 配置类错误在创建任何套接字之前返回；
/// - 资源类错误意味着 `Listen` 已中止，不会以错误权限继续运行；
/// - [`is_expected_close`](SocketError::is_expected_close) 为 `true` 的错误属于正常拆除过程，
///   引擎不会把它们投递给错误回调。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum SocketError {
    #[error("handler is not configured")]
    MissingHandler,
    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress {
        address: String,
        reason: &'static str,
    },
    #[error("invalid network protocol `{0}`")]
    InvalidProtocol(String),
    #[error("invalid unix permissions `{0}`")]
    InvalidPermissions(String),
    #[error("invalid unix group id {0}")]
    InvalidGroup(u32),
    #[error("invalid tls configuration: {0}")]
    InvalidTlsConfig(&'static str),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("connection is not established")]
    NotConnected,
    #[error("connection is closed")]
    Closed,
    #[error("{op} cancelled")]
    Cancelled { op: OperationKind },
    #[error("{op} timed out")]
    Timeout { op: OperationKind },
    #[error("{op}: {source}")]
    Io {
        op: OperationKind,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("{action} `{}`: {source}", path.display())]
    Resource {
        path: PathBuf,
        action: ResourceAction,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("tls handshake failed: {source}")]
    Handshake {
        #[source]
        source: Arc<io::Error>,
    },
    #[error("datagram peer is unknown")]
    UnknownPeer,
    #[error("server is not running")]
    NotRunning,
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server did not stop before the shutdown deadline")]
    ShutdownTimeout,
}

impl SocketError {
    /// 把 `io::Error` 包装为带操作上下文的错误；超时类 IO 错误归入 `Timeout`。
    pub fn io(op: OperationKind, error: io::Error) -> Self {
        if error.kind() == io::ErrorKind::TimedOut {
            return SocketError::Timeout { op };
        }
        SocketError::Io {
            op,
            source: Arc::new(error),
        }
    }

    /// 构造资源错误。
    pub fn resource(path: impl Into<PathBuf>, action: ResourceAction, error: io::Error) -> Self {
        SocketError::Resource {
            path: path.into(),
            action,
            source: Arc::new(error),
        }
    }

    /// 构造握手错误。
    pub fn handshake(error: io::Error) -> Self {
        SocketError::Handshake {
            source: Arc::new(error),
        }
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            SocketError::MissingHandler => "spark.socket.config.missing_handler",
            SocketError::InvalidAddress { .. } => "spark.socket.config.invalid_address",
            SocketError::InvalidProtocol(_) => "spark.socket.config.invalid_protocol",
            SocketError::InvalidPermissions(_) => "spark.socket.config.invalid_permissions",
            SocketError::InvalidGroup(_) => "spark.socket.config.invalid_group",
            SocketError::InvalidTlsConfig(_) => "spark.socket.config.invalid_tls",
            SocketError::InvalidConfig(_) => "spark.socket.config.invalid",
            SocketError::NotConnected => "spark.socket.conn.not_connected",
            SocketError::Closed => "spark.socket.conn.closed",
            SocketError::Cancelled { .. } => "spark.socket.cancelled",
            SocketError::Timeout { .. } => "spark.socket.timeout",
            SocketError::Io { op, .. } => op.code,
            SocketError::Resource { .. } => "spark.socket.resource.unix_file",
            SocketError::Handshake { .. } => OperationKind::HANDSHAKE.code,
            SocketError::UnknownPeer => "spark.socket.conn.unknown_peer",
            SocketError::NotRunning => "spark.socket.instance.not_running",
            SocketError::AlreadyRunning => "spark.socket.instance.already_running",
            SocketError::ShutdownTimeout => "spark.socket.shutdown_timeout",
        }
    }

    /// 错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            SocketError::MissingHandler
            | SocketError::InvalidAddress { .. }
            | SocketError::InvalidProtocol(_)
            | SocketError::InvalidPermissions(_)
            | SocketError::InvalidGroup(_)
            | SocketError::InvalidTlsConfig(_)
            | SocketError::InvalidConfig(_) => ErrorCategory::Configuration,
            SocketError::NotRunning | SocketError::AlreadyRunning => ErrorCategory::Instance,
            SocketError::NotConnected
            | SocketError::Closed
            | SocketError::Io { .. }
            | SocketError::Handshake { .. }
            | SocketError::UnknownPeer => ErrorCategory::Transient,
            SocketError::Resource { .. } => ErrorCategory::Resource,
            SocketError::Cancelled { .. } => ErrorCategory::Cancelled,
            SocketError::Timeout { .. } | SocketError::ShutdownTimeout => ErrorCategory::Timeout,
        }
    }

    /// 底层 IO 错误（如有）。
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            SocketError::Io { source, .. }
            | SocketError::Resource { source, .. }
            | SocketError::Handshake { source } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// 是否属于拆除过程中的正常错误（对端已关闭、本端已关闭、上下文已取消）。
    pub fn is_expected_close(&self) -> bool {
        match self {
            SocketError::Closed | SocketError::Cancelled { .. } => true,
            SocketError::Io { source, .. } => is_closed_connection(source),
            _ => false,
        }
    }

    /// 是否为取消错误。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SocketError::Cancelled { .. })
    }
}

/// 判断 IO 错误是否只是“连接已关闭”的不同表述。
pub fn is_closed_connection(error: &io::Error) -> bool {
    use io::ErrorKind;
    matches!(
        error.kind(),
        ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(
            SocketError::MissingHandler.category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            SocketError::NotRunning.category(),
            ErrorCategory::Instance
        );
        assert_eq!(SocketError::NotConnected.category(), ErrorCategory::Transient);
        let resource = SocketError::resource(
            "/tmp/x.sock",
            ResourceAction::Chmod,
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(resource.category(), ErrorCategory::Resource);
        assert!(resource.category().aborts_engine());
        assert!(resource.to_string().contains("/tmp/x.sock"));
    }

    #[test]
    fn io_timeouts_become_timeout_errors() {
        let err = SocketError::io(
            OperationKind::READ,
            io::Error::from(io::ErrorKind::TimedOut),
        );
        assert!(matches!(err, SocketError::Timeout { .. }));
        assert_eq!(err.code(), "spark.socket.timeout");
    }

    #[test]
    fn closed_connection_errors_are_expected() {
        let reset = SocketError::io(
            OperationKind::WRITE,
            io::Error::from(io::ErrorKind::ConnectionReset),
        );
        assert!(reset.is_expected_close());
        assert_eq!(reset.code(), OperationKind::WRITE.code);

        let refused = SocketError::io(
            OperationKind::CONNECT,
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert!(!refused.is_expected_close());
        assert!(refused.io_error().is_some());

        let cloned = refused.clone();
        assert_eq!(cloned.to_string(), refused.to_string());
    }
}
