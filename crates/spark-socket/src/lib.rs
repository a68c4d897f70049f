#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = r#"
# spark-socket

## 设计动机（Why）
- **定位**：在 Tokio 之上为 TCP、UDP、Unix 流与 Unix 报文四类传输提供统一的服务端/客户端抽象，
  覆盖连接生命周期、半关闭、关停排空、可选 TLS 与异步可观测回调。
- **架构角色**：`spark-socket-core` 描述契约（地址、状态、错误、配置），本 crate 负责全部 IO：
  引擎经 [`TransportSelector`] 监听或拨号，得到 [`Connection`]，再把 [`Reader`]/[`Writer`] 交给应用层 [`Handler`]。

## 核心契约（What）
- [`SocketServer`]：`listen` 阻塞直至关停且所有连接任务退出；`shutdown` 触发排空并以截止时间为上限等待；
- [`SocketClient`]：至多一条关联，`connect` 原子替换旧关联，`once` 提供一次性请求/应答；
- [`Connection`]：读/写两个方向独立关闭，只有两侧都关闭才取消共享上下文；
- [`CallbackRegistry`]：错误/信息回调在有界队列的工作任务中执行，panic 被隔离，队列满时丢弃事件。

## 实现策略（How）
- 控制流统一由 [`CallContext`] 约束：调用方 → 引擎 → 连接 → 底层句柄关闭；
- 连接任务与 Handler 任务都登记在 [`TaskTracker`] 中，`listen` 在全部退出后才返回；
- Unix 套接字文件的 umask、权限与属组修正经由 `nix` 完成，文件随监听端释放而删除。

## 风险提示（Trade-offs）
- 宽限期是启发式参数，不保证对端在此期间读完所有在途数据；
- 报文服务端只有一个关联，Handler 在整个生命周期内只调用一次。
"#]

pub mod callback;
pub mod client;
pub mod conn;
pub mod context;
pub mod handler;
pub mod selector;
pub mod server;
pub mod tls;
pub mod tracker;
pub mod unix_fs;

pub use callback::{CallbackRegistry, DEFAULT_CALLBACK_QUEUE};
pub use client::SocketClient;
pub use conn::{Connection, Reader, Writer};
pub use context::{CallContext, Cancellation};
pub use handler::{BoxFuture, ConnectionObserver, Handler};
pub use selector::{BoundListener, CloseSemantics, TransportSelector};
pub use server::{SocketServer, SocketServerBuilder};
pub use tls::TlsConfigSource;
pub use tracker::TaskTracker;
pub use unix_fs::SocketFileGuard;

pub use spark_socket_core::{
    ClientConfig, ConnState, DrainPolicy, EndpointAddress, ErrorCategory, NetworkFamily,
    OperationKind, PeerAddr, Result, ServerConfig, ServerPhase, SocketError,
};
