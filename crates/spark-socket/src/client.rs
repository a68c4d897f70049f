//! 客户端引擎。
//!
//! # 教案级说明
//!
//! - **意图（Why）**：一个客户端实例至多持有一条关联；端点、关联与 TLS 设置必须作为整体被读取，
//!   否则并发的 `connect` 与 `read` 可能看到“新端点 + 旧关联”这样的撕裂组合；
//! - **契约（What）**：
//!   - [`SocketClient::connect`] 拨号成功后原子替换关联，被替换的旧关联恰好关闭一次；
//!   - [`SocketClient::close`] 原子取走关联，与并发的 `connect` 不会重复关闭同一关联；
//!   - 未连接时 `read`/`write`/`close` 返回 [`SocketError::NotConnected`]；
//! - **实现（How）**：全部可变字段位于一个带版本号的 [`ClientState`] 快照中，
//!   存放在 `ArcSwap` 里并通过 `rcu` 整体替换；`rcu` 返回被替换的快照，调用方据此关闭旧关联。

use std::{fmt, net::SocketAddr, path::Path, sync::Arc};

use arc_swap::ArcSwap;
use spark_socket_core::{
    ClientConfig, ConnState, DEFAULT_BUFFER_SIZE, EndpointAddress, NetworkFamily, OperationKind,
    PeerAddr, Result, SocketError,
};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    callback::{CallbackRegistry, DEFAULT_CALLBACK_QUEUE},
    conn::Connection,
    context::{CallContext, run_with_context},
    selector::TransportSelector,
    tls::{ClientTls, TlsConfigSource},
};

/// 客户端状态快照。每次修改都整体替换，并递增 `version`。
#[derive(Clone, Default)]
struct ClientState {
    version: u64,
    endpoint: Option<EndpointAddress>,
    server_name: Option<String>,
    association: Option<Connection>,
    tls: Option<ClientTls>,
}

impl ClientState {
    fn next(&self) -> Self {
        Self {
            version: self.version.wrapping_add(1),
            ..self.clone()
        }
    }
}

struct ClientInner {
    state: ArcSwap<ClientState>,
    callbacks: Arc<CallbackRegistry>,
}

/// 套接字客户端。克隆得到的句柄共享同一状态。
#[derive(Clone)]
pub struct SocketClient {
    inner: Arc<ClientInner>,
}

impl SocketClient {
    /// 以配置创建客户端；配置在此处校验，但不会拨号。
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = config.validate()?;
        let client = Self::with_queue(config.callback_queue);
        client.inner.state.store(Arc::new(ClientState {
            version: 1,
            endpoint: Some(endpoint),
            server_name: config.server_name,
            ..ClientState::default()
        }));
        Ok(client)
    }

    /// 未配置端点的客户端；`connect` 会以地址错误失败，直到调用 [`reconfigure`](Self::reconfigure)。
    pub fn detached() -> Self {
        Self::with_queue(DEFAULT_CALLBACK_QUEUE)
    }

    fn with_queue(capacity: usize) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                state: ArcSwap::from_pointee(ClientState::default()),
                callbacks: Arc::new(CallbackRegistry::new(capacity)),
            }),
        }
    }

    /// 整体替换端点。已建立的关联保持不变，下一次 `connect` 使用新端点；
    /// 新端点不是 TCP 时丢弃 TLS 设置。
    pub fn reconfigure(&self, config: ClientConfig) -> Result<()> {
        let endpoint = config.validate()?;
        let keep_tls = endpoint.family().supports_tls();
        self.inner.state.rcu(|current| {
            let mut next = current.next();
            next.endpoint = Some(endpoint.clone());
            next.server_name = config.server_name.clone();
            if !keep_tls {
                next.tls = None;
            }
            next
        });
        Ok(())
    }

    /// 状态快照的版本号，每次成功修改递增。
    pub fn version(&self) -> u64 {
        self.inner.state.load().version
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

    /// 启用或关闭 TLS。
    ///
    /// 只有 TCP 端点支持 TLS；其它网络族上本调用是无操作并返回成功，
    /// 是否真正生效以 [`tls_active`](Self::tls_active) 为准。
    /// `server_name` 缺省时依次回退到配置中的 `server_name` 与地址中的主机部分。
    pub fn set_tls(
        &self,
        enable: bool,
        source: Option<&dyn TlsConfigSource>,
        server_name: Option<&str>,
    ) -> Result<()> {
        let snapshot = self.inner.state.load_full();
        let endpoint = snapshot.endpoint.as_ref().ok_or_else(missing_endpoint)?;
        if !endpoint.family().supports_tls() {
            tracing::debug!(network = %endpoint.family(), "tls ignored for non-tcp client");
            return Ok(());
        }
        let tls = if enable {
            let name = server_name
                .map(str::to_owned)
                .or_else(|| snapshot.server_name.clone())
                .unwrap_or_else(|| host_of(endpoint.address()).to_owned());
            Some(ClientTls::new(source, &name)?)
        } else {
            None
        };
        self.inner.state.rcu(|current| {
            let mut next = current.next();
            next.tls = tls.clone();
            next
        });
        Ok(())
    }

    pub fn tls_active(&self) -> bool {
        let snapshot = self.inner.state.load();
        snapshot.tls.is_some()
            && snapshot
                .endpoint
                .as_ref()
                .is_some_and(|endpoint| endpoint.family() == NetworkFamily::Tcp)
    }

    /// 拨号（流式）或关联（报文），成功后替换并关闭旧关联。拨号错误原样返回。
    pub async fn connect(&self, ctx: &CallContext) -> Result<()> {
        let snapshot = self.inner.state.load_full();
        let endpoint = snapshot.endpoint.as_ref().ok_or_else(missing_endpoint)?;
        self.inner
            .callbacks
            .info(&PeerAddr::Unknown, &endpoint_label(endpoint), ConnState::Dial);

        let conn = match TransportSelector::dial(
            endpoint,
            ctx,
            snapshot.tls.as_ref(),
            Arc::clone(&self.inner.callbacks),
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(
                    network = %endpoint.family(),
                    address = %endpoint,
                    error.code = err.code(),
                    error = %err,
                    "socket client dial failed"
                );
                self.inner.callbacks.error(&err);
                return Err(err);
            }
        };
        conn.info(ConnState::New);
        tracing::debug!(
            network = %endpoint.family(),
            peer = %conn.peer_addr(),
            "socket client connected"
        );

        let previous = self.inner.state.rcu(|current| {
            let mut next = current.next();
            next.association = Some(conn.clone());
            next
        });
        if let Some(old) = previous.association.as_ref() {
            old.close().await;
        }
        Ok(())
    }

    /// 是否持有关联；不探测对端可达性。
    pub fn is_connected(&self) -> bool {
        self.inner.state.load().association.is_some()
    }

    /// 原子取走并关闭当前关联。
    pub async fn close(&self) -> Result<()> {
        let previous = self.inner.state.rcu(|current| {
            if current.association.is_none() {
                return Arc::clone(current);
            }
            let mut next = current.next();
            next.association = None;
            Arc::new(next)
        });
        let conn = previous
            .association
            .as_ref()
            .ok_or(SocketError::NotConnected)?;
        conn.close().await;
        Ok(())
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.association()?.read(buf).await
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.association()?.write(buf).await
    }

    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.inner
            .state
            .load()
            .association
            .as_ref()
            .map(|conn| conn.local_addr().clone())
    }

    pub fn peer_addr(&self) -> Option<PeerAddr> {
        self.inner
            .state
            .load()
            .association
            .as_ref()
            .map(|conn| conn.peer_addr().clone())
    }

    /// 一次性请求：连接、发送 `request` 的全部字节，然后无论成败都关闭关联。
    pub async fn once<R>(&self, ctx: &CallContext, request: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.once_with_response(ctx, request, |_| async { Ok(()) })
            .await
    }

    /// 与 [`once`](Self::once) 相同，但在发送完毕后把客户端自身交给 `response` 读取应答。
    pub async fn once_with_response<R, F, Fut>(
        &self,
        ctx: &CallContext,
        request: R,
        response: F,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce(SocketClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let outcome = self.exchange(ctx, request, response).await;
        match self.close().await {
            Ok(()) | Err(SocketError::NotConnected) => {}
            Err(err) => tracing::debug!(error = %err, "one-shot close failed"),
        }
        outcome
    }

    async fn exchange<R, F, Fut>(
        &self,
        ctx: &CallContext,
        mut request: R,
        response: F,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        F: FnOnce(SocketClient) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.connect(ctx).await?;
        let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
        loop {
            let read = run_with_context(ctx, OperationKind::READ, request.read(&mut buf)).await?;
            if read == 0 {
                break;
            }
            self.write(&buf[..read]).await?;
        }
        response(self.clone()).await
    }

    fn association(&self) -> Result<Connection> {
        self.inner
            .state
            .load()
            .association
            .clone()
            .ok_or(SocketError::NotConnected)
    }
}

impl fmt::Debug for SocketClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.load();
        f.debug_struct("SocketClient")
            .field("version", &state.version)
            .field("endpoint", &state.endpoint)
            .field("association", &state.association)
            .field("tls", &state.tls.is_some())
            .finish()
    }
}

fn missing_endpoint() -> SocketError {
    SocketError::InvalidAddress {
        address: String::new(),
        reason: "address is not configured",
    }
}

fn endpoint_label(endpoint: &EndpointAddress) -> PeerAddr {
    match endpoint.unix_path() {
        Some(path) => PeerAddr::Unix(Some(Path::to_path_buf(path))),
        None => endpoint
            .address()
            .parse::<SocketAddr>()
            .map_or(PeerAddr::Unknown, PeerAddr::Inet),
    }
}

/// `host:port` 中的主机部分，去掉 IPv6 方括号。
fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
