#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# spark-socket-core

## 设计动机（Why）
- **定位**：为 `spark-socket` 的 TCP/UDP/Unix 流/Unix 报文四类传输提供与运行时无关的共享契约，
  使服务端引擎、客户端引擎与连接包装器在同一套类型上协作。
- **架构角色**：本 crate 不做任何 IO，只描述“地址是什么、连接处于什么状态、出了错如何分类、
  配置如何声明与校验”，Tokio 实现层只依赖这些契约。

## 核心契约（What）
- [`EndpointAddress`]：网络族 + 地址字符串 + Unix 权限位/属组，构造后不可变；
- [`ConnState`]：信息回调上报的连接生命周期状态；
- [`HalfCloseState`] / [`AtomicHalfClose`]：读/写两个方向的关闭状态机，只有两侧都关闭时才允许取消共享上下文；
- [`ServerPhase`] / [`AtomicServerPhase`]：服务端 `Idle → Listening → Running → Draining → Stopped` 状态机；
- [`SocketError`] / [`ErrorCategory`]：配置、瞬时 IO、实例、资源四类错误；
- [`ServerConfig`] / [`ClientConfig`]：可由 TOML 反序列化的声明式配置。

## 实现策略（How）
- 所有跨任务共享的状态机都以单个原子字节承载，通过 CAS 迁移，避免“两个布尔值分别写入”带来的撕裂读；
- 错误类型实现 `Clone`（底层 `io::Error` 以 `Arc` 共享），以便同一个错误既返回给调用方又投递给异步回调。
"#]

pub mod addr;
pub mod config;
pub mod error;
pub mod phase;
pub mod shutdown;
pub mod state;

pub use addr::{EndpointAddress, NetworkFamily, PeerAddr, UnixPermissions};
pub use config::{ClientConfig, DrainPolicy, ServerConfig};
pub use error::{ErrorCategory, OperationKind, ResourceAction, SocketError, is_closed_connection};
pub use phase::{AtomicServerPhase, ServerPhase};
pub use shutdown::{AtomicHalfClose, HalfCloseState, HalfCloseTransition, ShutdownDirection};
pub use state::ConnState;

/// 套接字 IO 的默认缓冲区大小（32 KiB）。
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// 传输层统一的返回别名。
pub type Result<T, E = SocketError> = core::result::Result<T, E>;
