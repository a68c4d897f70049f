//! 服务端引擎。
//!
//! # 教案级说明
//!
//! ## 状态机（What）
//! `Idle → Listening → Running → Draining → Stopped`，`Stopped` 之后可再次 `listen`：
//! - `listen`：校验 Handler 与地址，绑定监听端（Unix 路径经过残留清理、umask 收窄与权限修正），
//!   重置连接计数并安装新的停止/排空信号，随后进入 accept 循环（流式）或单关联服务（报文）；
//! - 监督任务等待调用方上下文或内部停止信号，任一触发即标记排空并唤醒 accept 循环；
//! - 每条连接在独立任务中处理：计数 +1、调用观察者、TLS 握手、构建包装器、并发运行 Handler，
//!   随后只等待连接自身的取消、服务端排空信号或空闲超时；
//! - 拆除：取消连接上下文、计数 -1、关闭写方向、按宽限期等待、关闭读方向与句柄；
//! - 循环退出后释放监听端与 Unix 文件，等待全部被跟踪任务退出，最后进入 `Stopped`。
//!
//! ## 失败语义
//! - 绑定、权限或属组修正失败：经错误回调上报并中止 `listen`；
//! - 非排空期间的 accept 失败：上报后短暂退避继续循环；排空期间的 accept 失败被静默。

use std::{
    fmt, io,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures_util::FutureExt;
use socket2::SockRef;
use spark_socket_core::{
    AtomicServerPhase, ConnState, DrainPolicy, EndpointAddress, NetworkFamily, OperationKind,
    PeerAddr, Result, ServerConfig, ServerPhase, SocketError,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_rustls::TlsAcceptor;

use crate::{
    callback::{CallbackRegistry, DEFAULT_CALLBACK_QUEUE},
    conn::{Connection, DatagramSocket},
    context::{CallContext, Cancellation},
    handler::{ConnectionObserver, Handler},
    selector::{
        AcceptedStream, BoundListener, StreamAcceptor, TransportSelector, boxed_parts, split_parts,
    },
    tls::{ServerTls, ServerTlsStream, TlsConfigSource},
    tracker::TaskTracker,
};

/// accept 失败后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(5);

type SharedHandler = Arc<Box<dyn Handler>>;

/// 一次 `listen` 运行期内的信号与监督者。
struct RunState {
    /// `shutdown` 触发。
    stop: Cancellation,
    /// 排空开始：唤醒 accept 循环与所有连接任务。
    gone: Cancellation,
    tracker: TaskTracker,
    drain: DrainPolicy,
    idle_timeout: Option<Duration>,
    family: NetworkFamily,
}

struct ServerInner {
    config: ArcSwapOption<ServerConfig>,
    handler: ArcSwapOption<Box<dyn Handler>>,
    observer: ArcSwapOption<Box<dyn ConnectionObserver>>,
    tls: ServerTls,
    callbacks: Arc<CallbackRegistry>,
    phase: AtomicServerPhase,
    open: AtomicI64,
    run: ArcSwapOption<RunState>,
    local: ArcSwapOption<PeerAddr>,
    stopped: Notify,
}

impl ServerInner {
    fn abort(&self, error: &SocketError) {
        tracing::error!(error.code = error.code(), error = %error, "socket server listen aborted");
        self.callbacks.error(error);
    }

    fn finish(&self) {
        self.local.store(None);
        self.phase.store(ServerPhase::Stopped);
        self.stopped.notify_waiters();
        self.callbacks.server_info("server stopped");
        tracing::debug!("socket server stopped");
    }

    fn report(&self, error: &SocketError, peer: &PeerAddr) {
        if error.is_expected_close() {
            return;
        }
        tracing::warn!(
            peer = %peer,
            error.code = error.code(),
            error = %error,
            "socket connection failed"
        );
        self.callbacks.error(error);
    }
}

/// 在线连接计数守卫：构造 +1，释放或析构时 -1，且只减一次。
struct OpenConnection {
    inner: Arc<ServerInner>,
    released: bool,
}

impl OpenConnection {
    fn acquire(inner: &Arc<ServerInner>) -> Self {
        inner.open.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
            released: false,
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.release();
    }
}

/// 套接字服务端。克隆得到的句柄共享同一实例。
#[derive(Clone)]
pub struct SocketServer {
    inner: Arc<ServerInner>,
}

impl SocketServer {
    /// 以配置创建服务端；配置在此处校验。
    pub fn new(config: ServerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> SocketServerBuilder {
        SocketServerBuilder::default()
    }

    /// 注册 Handler，替换已有 Handler。
    pub fn set_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(crate::Reader, crate::Writer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.set_service(handler);
    }

    /// 注册任意实现了 [`Handler`] 的服务。
    pub fn set_service<H: Handler>(&self, handler: H) {
        let handler: Box<dyn Handler> = Box::new(handler);
        self.inner.handler.store(Some(Arc::new(handler)));
    }

    /// 注册连接观察者。
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(SockRef<'_>) -> io::Result<()> + Send + Sync + 'static,
    {
        let observer: Box<dyn ConnectionObserver> = Box::new(observer);
        self.inner.observer.store(Some(Arc::new(observer)));
    }

    pub fn clear_observer(&self) {
        self.inner.observer.store(None);
    }

    /// 启用或关闭 TLS。非 TCP 服务端上为无操作并返回成功，此时 [`tls_active`](Self::tls_active) 仍为 `false`。
    pub fn set_tls(&self, enable: bool, source: Option<&dyn TlsConfigSource>) -> Result<()> {
        if let Some(config) = self.inner.config.load().as_ref()
            && !config.network.supports_tls()
        {
            tracing::debug!(network = %config.network, "tls ignored for non-tcp server");
            return Ok(());
        }
        self.inner.tls.configure(enable, source)
    }

    /// TLS 是否真正生效。
    pub fn tls_active(&self) -> bool {
        let tcp = self
            .inner
            .config
            .load()
            .as_ref()
            .is_some_and(|config| config.network.supports_tls());
        tcp && self.inner.tls.is_active()
    }

    /// 在空闲或已停止时整体替换配置。
    pub fn reconfigure(&self, config: ServerConfig) -> Result<()> {
        config.validate()?;
        match self.inner.phase.load() {
            ServerPhase::Idle | ServerPhase::Stopped => {
                self.inner.config.store(Some(Arc::new(config)));
                Ok(())
            }
            _ => Err(SocketError::AlreadyRunning),
        }
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.inner.callbacks
    }

    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        self.inner.callbacks.set_error(callback);
    }

    pub fn on_info<F>(&self, callback: F)
    where
        F: Fn(&PeerAddr, &PeerAddr, ConnState) + Send + Sync + 'static,
    {
        self.inner.callbacks.set_info(callback);
    }

    pub fn on_server_info<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.callbacks.set_server_info(callback);
    }

    pub fn phase(&self) -> ServerPhase {
        self.inner.phase.load()
    }

    /// 是否仍在接受连接（或服务报文关联）。排空开始即返回 `false`。
    pub fn is_running(&self) -> bool {
        self.phase() == ServerPhase::Running
    }

    /// 是否已开始排空或已停止。
    pub fn is_gone(&self) -> bool {
        matches!(self.phase(), ServerPhase::Draining | ServerPhase::Stopped)
    }

    /// 在线连接数。
    pub fn open_connections(&self) -> i64 {
        self.inner.open.load(Ordering::Acquire)
    }

    /// 运行期间实际绑定的本地地址。
    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.inner.local.load_full().map(|addr| (*addr).clone())
    }

    /// 等待服务端进入 `Stopped`。
    pub async fn done(&self) {
        loop {
            let notified = self.inner.stopped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.phase() == ServerPhase::Stopped {
                return;
            }
            notified.await;
        }
    }

    /// 监听并服务，直到 `ctx` 结束或调用 [`shutdown`](Self::shutdown)；返回前等待全部连接任务退出。
    pub async fn listen(&self, ctx: &CallContext) -> Result<()> {
        let inner = &self.inner;
        let (handler, config, endpoint) = match self.prepare() {
            Ok(prepared) => prepared,
            Err(err) => {
                inner.abort(&err);
                return Err(err);
            }
        };
        if inner.phase.begin_listen().is_err() {
            return Err(SocketError::AlreadyRunning);
        }

        let run = Arc::new(RunState {
            stop: Cancellation::new(),
            gone: Cancellation::new(),
            tracker: TaskTracker::new(),
            drain: config.drain,
            idle_timeout: config.idle_timeout(),
            family: endpoint.family(),
        });
        inner.open.store(0, Ordering::Release);
        inner.run.store(Some(Arc::clone(&run)));

        let bound = match TransportSelector::listen(&endpoint).await {
            Ok(bound) => bound,
            Err(err) => {
                inner.abort(&err);
                inner.finish();
                return Err(err);
            }
        };
        if endpoint.family().is_datagram()
            && let Some(observer) = inner.observer.load_full()
            && let Err(err) = observer.observe(bound.sock_ref())
        {
            let err = SocketError::io(OperationKind::CONFIGURE, err);
            inner.abort(&err);
            drop(bound);
            inner.finish();
            return Err(err);
        }

        let local = bound.local_addr();
        inner.local.store(Some(Arc::new(local.clone())));
        inner.phase.transition(ServerPhase::Listening, ServerPhase::Running);
        tracing::debug!(
            network = %endpoint.family(),
            address = %endpoint,
            local = %local,
            "socket server listening"
        );
        inner
            .callbacks
            .server_info(format!("listening on {endpoint} ({local})"));

        let supervisor = tokio::spawn(supervise(
            Arc::clone(inner),
            Arc::clone(&run),
            ctx.clone(),
        ));

        match bound {
            BoundListener::Tcp(listener) => {
                let tls = inner.tls.acceptor();
                accept_loop(inner, &run, StreamAcceptor::Tcp(listener), handler, tls).await;
            }
            BoundListener::Unix { listener, file } => {
                accept_loop(inner, &run, StreamAcceptor::Unix(listener), handler, None).await;
                drop(file);
            }
            BoundListener::Udp(socket) => {
                serve_datagram(inner, &run, DatagramSocket::Udp(socket), handler).await;
            }
            BoundListener::UnixDatagram { socket, file } => {
                serve_datagram(inner, &run, DatagramSocket::Unix(socket), handler).await;
                drop(file);
            }
        }

        run.tracker.wait_for_idle().await;
        run.stop.cancel();
        if let Err(err) = supervisor.await {
            tracing::warn!(error = %err, "socket server supervisor task failed");
        }
        inner.finish();
        Ok(())
    }

    /// 停止服务端。
    ///
    /// - 从未启动：`Err(NotRunning)`；
    /// - 已停止：`Ok(())`；
    /// - 其它：触发停止信号并等待 `Stopped`，以调用方截止时间或配置的 `shutdown_timeout` 为上限，
    ///   超时返回 `Err(ShutdownTimeout)`。
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<()> {
        match self.phase() {
            ServerPhase::Idle => return Err(SocketError::NotRunning),
            ServerPhase::Stopped => return Ok(()),
            _ => {}
        }
        let Some(run) = self.inner.run.load_full() else {
            return Err(SocketError::NotRunning);
        };
        if run.stop.cancel() {
            tracing::debug!("socket server shutdown requested");
        }
        let limit = self
            .inner
            .config
            .load()
            .as_ref()
            .map_or(Duration::from_secs(10), |config| config.shutdown_timeout());

        tokio::select! {
            biased;
            _ = self.done() => Ok(()),
            _ = tokio::time::sleep(limit) => Err(SocketError::ShutdownTimeout),
            err = ctx.done(OperationKind::DRAIN) => Err(match err {
                SocketError::Timeout { .. } => SocketError::ShutdownTimeout,
                other => other,
            }),
        }
    }

    fn prepare(&self) -> Result<(SharedHandler, Arc<ServerConfig>, EndpointAddress)> {
        let handler = self
            .inner
            .handler
            .load_full()
            .ok_or(SocketError::MissingHandler)?;
        let config = self
            .inner
            .config
            .load_full()
            .ok_or_else(|| SocketError::InvalidAddress {
                address: String::new(),
                reason: "address is not configured",
            })?;
        let endpoint = config.validate()?;
        Ok((handler, config, endpoint))
    }
}

impl fmt::Debug for SocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("phase", &self.phase())
            .field("open_connections", &self.open_connections())
            .field("local", &self.local_addr())
            .field("tls", &self.inner.tls)
            .finish()
    }
}

/// [`SocketServer`] 的构造器。
#[derive(Default)]
pub struct SocketServerBuilder {
    config: Option<ServerConfig>,
    handler: Option<Box<dyn Handler>>,
    observer: Option<Box<dyn ConnectionObserver>>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl SocketServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(crate::Reader, crate::Writer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(SockRef<'_>) -> io::Result<()> + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn tls(mut self, source: &dyn TlsConfigSource) -> Self {
        self.tls = source.server_config();
        self
    }

    pub fn build(self) -> Result<SocketServer> {
        if let Some(config) = &self.config {
            config.validate()?;
        }
        let capacity = self
            .config
            .as_ref()
            .map_or(DEFAULT_CALLBACK_QUEUE, |config| config.callback_queue);
        let server = SocketServer {
            inner: Arc::new(ServerInner {
                config: ArcSwapOption::new(self.config.map(Arc::new)),
                handler: ArcSwapOption::new(self.handler.map(Arc::new)),
                observer: ArcSwapOption::new(self.observer.map(Arc::new)),
                tls: ServerTls::default(),
                callbacks: Arc::new(CallbackRegistry::new(capacity)),
                phase: AtomicServerPhase::new(),
                open: AtomicI64::new(0),
                run: ArcSwapOption::empty(),
                local: ArcSwapOption::empty(),
                stopped: Notify::new(),
            }),
        };
        if let Some(tls) = self.tls {
            server.set_tls(true, Some(&tls))?;
        }
        Ok(server)
    }
}

async fn supervise(inner: Arc<ServerInner>, run: Arc<RunState>, ctx: CallContext) {
    tokio::select! {
        _ = ctx.done(OperationKind::LISTEN) => {
            tracing::debug!("listen context finished");
        }
        _ = run.stop.cancelled() => {}
    }
    if inner.phase.begin_drain() {
        inner.callbacks.server_info("server draining");
        tracing::debug!(open = inner.open.load(Ordering::Acquire), "socket server draining");
    }
    run.gone.cancel();
}

async fn accept_loop(
    inner: &Arc<ServerInner>,
    run: &Arc<RunState>,
    acceptor: StreamAcceptor,
    handler: SharedHandler,
    tls: Option<TlsAcceptor>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = run.gone.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                run.tracker.spawn(serve_stream(
                    Arc::clone(inner),
                    Arc::clone(run),
                    Arc::clone(&handler),
                    stream,
                    tls.clone(),
                ));
            }
            Err(_) if run.gone.is_cancelled() => break,
            Err(err) => {
                let err = SocketError::io(OperationKind::ACCEPT, err);
                tracing::warn!(error.code = err.code(), error = %err, "socket accept failed");
                inner.callbacks.error(&err);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    drop(acceptor);
    inner.callbacks.server_info("listener closed");
}

async fn serve_stream(
    inner: Arc<ServerInner>,
    run: Arc<RunState>,
    handler: SharedHandler,
    stream: AcceptedStream,
    tls: Option<TlsAcceptor>,
) {
    let mut open = OpenConnection::acquire(&inner);
    let peer = stream.peer_label();

    if let Some(observer) = inner.observer.load_full()
        && let Err(err) = observer.observe(stream.sock_ref())
    {
        inner.report(&SocketError::io(OperationKind::CONFIGURE, err), &peer);
        return;
    }

    let conn = match wrap_stream(&inner, &run, stream, tls).await {
        Ok(conn) => conn,
        Err(err) => {
            inner.report(&err, &peer);
            return;
        }
    };
    conn.info(ConnState::New);
    tracing::trace!(peer = %peer, "connection accepted");

    let handler_task = spawn_handler(&run, handler, conn.clone());

    let idle = wait_for_teardown(&conn, &run).await;
    if idle {
        tracing::debug!(peer = %peer, "connection idle timeout");
    }

    conn.cancellation().cancel();
    open.release();
    conn.close_write().await;
    tokio::time::sleep(run.drain.grace(run.gone.is_cancelled())).await;
    conn.close_read().await;
    conn.close().await;
    abort_handler(handler_task, &peer);
}

async fn wrap_stream(
    inner: &Arc<ServerInner>,
    run: &RunState,
    stream: AcceptedStream,
    tls: Option<TlsAcceptor>,
) -> Result<Connection> {
    let parts = match stream {
        AcceptedStream::Tcp(tcp) => {
            let control = SockRef::from(&tcp).try_clone().ok();
            let local = tcp.local_addr().map_or(PeerAddr::Unknown, PeerAddr::from);
            let remote = tcp.peer_addr().map_or(PeerAddr::Unknown, PeerAddr::from);
            match tls {
                Some(acceptor) => {
                    let secured: ServerTlsStream = tokio::select! {
                        _ = run.gone.cancelled() => {
                            return Err(SocketError::Cancelled { op: OperationKind::HANDSHAKE });
                        }
                        handshake = acceptor.accept(tcp) => {
                            handshake.map_err(SocketError::handshake)?
                        }
                    };
                    split_parts(secured, control, local, remote)
                }
                None => {
                    let (read, write) = tcp.into_split();
                    boxed_parts(read, write, control, local, remote)
                }
            }
        }
        AcceptedStream::Unix(unix) => {
            let control = SockRef::from(&unix).try_clone().ok();
            let local = unix
                .local_addr()
                .map_or(PeerAddr::Unknown, |addr| crate::conn::unix_label(&addr));
            let remote = unix
                .peer_addr()
                .map_or(PeerAddr::Unknown, |addr| crate::conn::unix_label(&addr));
            let (read, write) = unix.into_split();
            boxed_parts(read, write, control, local, remote)
        }
    };
    Ok(Connection::from_stream(
        run.family,
        parts,
        Arc::clone(&inner.callbacks),
    ))
}

/// 在被跟踪的任务中运行 Handler；Handler 返回（或 panic）后关闭两个方向。
fn spawn_handler(run: &RunState, handler: SharedHandler, conn: Connection) -> JoinHandle<()> {
    run.tracker.spawn(async move {
        conn.info(ConnState::Handler);
        let outcome = AssertUnwindSafe(handler.handle(conn.reader(), conn.writer()))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!(peer = %conn.peer_addr(), "socket handler panicked");
        }
        conn.close_write().await;
        conn.close_read().await;
    })
}

/// 拆除完成后仍未返回的 Handler 被强制中止，`listen` 的等待因此受宽限期约束。
fn abort_handler(task: JoinHandle<()>, peer: &PeerAddr) {
    if !task.is_finished() {
        tracing::warn!(peer = %peer, "socket handler ignored cancellation, aborting");
        task.abort();
    }
}

/// 等待连接结束、服务端排空或空闲超时；空闲超时返回 `true`。
async fn wait_for_teardown(conn: &Connection, run: &RunState) -> bool {
    loop {
        let idle_check = async {
            match run.idle_timeout {
                Some(limit) => tokio::time::sleep(limit.saturating_sub(conn.idle_for())).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = conn.done() => return false,
            _ = run.gone.cancelled() => return false,
            _ = idle_check => {
                if run.idle_timeout.is_some_and(|limit| conn.idle_for() >= limit) {
                    return true;
                }
            }
        }
    }
}

/// 报文服务端：绑定的套接字即唯一关联，Handler 在其整个生命周期内只调用一次。
async fn serve_datagram(
    inner: &Arc<ServerInner>,
    run: &Arc<RunState>,
    socket: DatagramSocket,
    handler: SharedHandler,
) {
    let mut open = OpenConnection::acquire(inner);
    let conn = Connection::from_datagram(run.family, socket, false, Arc::clone(&inner.callbacks));
    conn.info(ConnState::New);
    let mut handler_task = spawn_handler(run, handler, conn.clone());

    tokio::select! {
        _ = conn.done() => {}
        _ = run.gone.cancelled() => {}
    }
    conn.cancellation().cancel();
    open.release();
    conn.close().await;
    let grace = run.drain.grace(run.gone.is_cancelled());
    if tokio::time::timeout(grace, &mut handler_task).await.is_err() {
        abort_handler(handler_task, conn.local_addr());
    }
}
