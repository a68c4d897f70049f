//! 连接包装器：一个底层句柄 + 共享取消上下文 + 读/写两个独立能力对象。
//!
//! # 教案级说明
//!
//! ## 意图（Why）
//! - 拆分读关闭与写关闭，使一端能先声明“我已发送完毕”，同时继续接收对端仍在途的数据；
//! - 只有两个方向都关闭后才取消共享上下文，避免一侧关闭过早毒化另一侧仍在使用的上下文。
//!
//! ## 契约（What）
//! - [`Reader::read`] / [`Writer::write`] 在触碰句柄前检查共享上下文；已取消时关闭本方向并返回取消错误；
//! - 进行中的 IO 与共享上下文竞速，上下文一旦取消立即以取消错误返回；
//! - 流式句柄（TCP、Unix 流、TLS over TCP）的 `close` 只关闭本方向；报文句柄没有半关闭，
//!   任一方向关闭即关闭整个句柄；
//! - [`Connection::close`] 强制关闭两个方向，且只执行一次。
//!
//! ## 实现（How）
//! - 半关闭状态为单个原子字节（[`AtomicHalfClose`]），迁移报告决定是否取消上下文；
//! - 流式句柄额外持有一份复制的控制套接字，即使字节流被 TLS 包裹也能单独关闭读方向；
//! - 读、写半部各自由异步互斥锁保护，读写可并发但同一方向内保持调用顺序。

use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use spark_socket_core::{
    AtomicHalfClose, ConnState, HalfCloseState, NetworkFamily, OperationKind, PeerAddr, Result,
    ShutdownDirection, SocketError,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{UdpSocket, UnixDatagram},
    sync::Mutex as AsyncMutex,
    time::Instant,
};

use crate::{
    callback::CallbackRegistry,
    context::{Cancellation, run_cancellable},
    selector::{CloseSemantics, TransportSelector},
};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// 写方向关闭时发送 EOF/close_notify 的等待上限，超时后直接在控制套接字上关闭写方向。
const WRITE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// 报文套接字。
#[derive(Debug)]
pub(crate) enum DatagramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

/// 报文回复目标。
#[derive(Clone, Debug)]
enum DatagramPeer {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl DatagramSocket {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.recv(buf).await,
            DatagramSocket::Unix(socket) => socket.recv(buf).await,
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<DatagramPeer>)> {
        match self {
            DatagramSocket::Udp(socket) => {
                let (n, from) = socket.recv_from(buf).await?;
                Ok((n, Some(DatagramPeer::Inet(from))))
            }
            DatagramSocket::Unix(socket) => {
                let (n, from) = socket.recv_from(buf).await?;
                Ok((n, from.as_pathname().map(|p| DatagramPeer::Unix(p.to_path_buf()))))
            }
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            DatagramSocket::Udp(socket) => socket.send(buf).await,
            DatagramSocket::Unix(socket) => socket.send(buf).await,
        }
    }

    async fn send_to(&self, buf: &[u8], peer: &DatagramPeer) -> io::Result<usize> {
        match (self, peer) {
            (DatagramSocket::Udp(socket), DatagramPeer::Inet(addr)) => {
                socket.send_to(buf, *addr).await
            }
            (DatagramSocket::Unix(socket), DatagramPeer::Unix(path)) => {
                socket.send_to(buf, path).await
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram peer does not match socket family",
            )),
        }
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            DatagramSocket::Udp(socket) => socket.take_error(),
            DatagramSocket::Unix(socket) => socket.take_error(),
        }
    }

    pub(crate) fn local_label(&self) -> PeerAddr {
        match self {
            DatagramSocket::Udp(socket) => socket
                .local_addr()
                .map_or(PeerAddr::Unknown, PeerAddr::from),
            DatagramSocket::Unix(socket) => socket
                .local_addr()
                .map_or(PeerAddr::Unknown, |addr| unix_label(&addr)),
        }
    }

    pub(crate) fn peer_label(&self) -> PeerAddr {
        match self {
            DatagramSocket::Udp(socket) => socket
                .peer_addr()
                .map_or(PeerAddr::Unknown, PeerAddr::from),
            DatagramSocket::Unix(socket) => socket
                .peer_addr()
                .map_or(PeerAddr::Unknown, |addr| unix_label(&addr)),
        }
    }
}

/// 把 Tokio 的 Unix 地址转换为日志/回调标签。
pub(crate) fn unix_label(addr: &tokio::net::unix::SocketAddr) -> PeerAddr {
    PeerAddr::Unix(addr.as_pathname().map(|path| path.to_path_buf()))
}

/// 流式连接的组成部分，由传输选择器或 TLS 握手产出。
pub(crate) struct StreamParts {
    pub read: BoxedRead,
    pub write: BoxedWrite,
    pub control: Option<socket2::Socket>,
    pub local: PeerAddr,
    pub remote: PeerAddr,
}

enum Io {
    Stream {
        reader: AsyncMutex<Option<BoxedRead>>,
        writer: AsyncMutex<Option<BoxedWrite>>,
        control: Mutex<Option<socket2::Socket>>,
    },
    Datagram {
        socket: ArcSwapOption<DatagramSocket>,
        connected: bool,
        last_peer: Mutex<Option<DatagramPeer>>,
    },
}

struct ConnShared {
    io: Io,
    family: NetworkFamily,
    cancellation: Cancellation,
    half: AtomicHalfClose,
    callbacks: Arc<CallbackRegistry>,
    local: PeerAddr,
    remote: PeerAddr,
    opened_at: Instant,
    last_activity_ms: AtomicU64,
    hard_closed: AtomicBool,
}

impl ConnShared {
    fn touch(&self) {
        let elapsed = self.opened_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.opened_at.elapsed();
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        now.saturating_sub(last)
    }

    fn info(&self, state: ConnState) {
        self.callbacks.info(&self.local, &self.remote, state);
    }

    fn report(&self, error: &SocketError) {
        if error.is_expected_close() {
            tracing::trace!(peer = %self.remote, error.code = error.code(), "connection io ended");
            return;
        }
        tracing::debug!(
            network = %self.family,
            peer = %self.remote,
            error.code = error.code(),
            error = %error,
            "connection io failed"
        );
        self.callbacks.error(error);
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.cancellation.is_cancelled() {
            self.close(ShutdownDirection::Read).await;
            return Err(SocketError::Cancelled {
                op: OperationKind::READ,
            });
        }
        if self.half.load().read_closed() {
            return Err(SocketError::Closed);
        }
        self.info(ConnState::Read);

        let result = match &self.io {
            Io::Stream { reader, .. } => {
                let mut guard = reader.lock().await;
                match guard.as_mut() {
                    Some(stream) => {
                        run_cancellable(&self.cancellation, OperationKind::READ, stream.read(buf))
                            .await
                    }
                    None => Err(SocketError::Closed),
                }
            }
            Io::Datagram {
                socket,
                connected,
                last_peer,
            } => match socket.load_full() {
                Some(socket) if *connected => {
                    run_cancellable(&self.cancellation, OperationKind::READ, socket.recv(buf)).await
                }
                Some(socket) => {
                    let received = run_cancellable(
                        &self.cancellation,
                        OperationKind::READ,
                        socket.recv_from(buf),
                    )
                    .await;
                    received.map(|(n, peer)| {
                        if peer.is_some() {
                            *last_peer.lock() = peer;
                        }
                        n
                    })
                }
                None => Err(SocketError::Closed),
            },
        };

        match result {
            Ok(n) => {
                self.touch();
                Ok(n)
            }
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.cancellation.is_cancelled() {
            self.close(ShutdownDirection::Write).await;
            return Err(SocketError::Cancelled {
                op: OperationKind::WRITE,
            });
        }
        if self.half.load().write_closed() {
            return Err(SocketError::Closed);
        }
        self.info(ConnState::Write);

        let result = match &self.io {
            Io::Stream { writer, .. } => {
                let mut guard = writer.lock().await;
                match guard.as_mut() {
                    Some(stream) => {
                        run_cancellable(&self.cancellation, OperationKind::WRITE, async {
                            stream.write_all(buf).await?;
                            stream.flush().await?;
                            Ok(buf.len())
                        })
                        .await
                    }
                    None => Err(SocketError::Closed),
                }
            }
            Io::Datagram {
                socket,
                connected,
                last_peer,
            } => match socket.load_full() {
                Some(socket) if *connected => {
                    run_cancellable(&self.cancellation, OperationKind::WRITE, socket.send(buf))
                        .await
                }
                Some(socket) => {
                    let peer = last_peer.lock().clone();
                    match peer {
                        Some(peer) => {
                            run_cancellable(
                                &self.cancellation,
                                OperationKind::WRITE,
                                socket.send_to(buf, &peer),
                            )
                            .await
                        }
                        None => Err(SocketError::UnknownPeer),
                    }
                }
                None => Err(SocketError::Closed),
            },
        };

        match result {
            Ok(n) => {
                self.touch();
                Ok(n)
            }
            Err(err) => {
                self.report(&err);
                Err(err)
            }
        }
    }

    /// 关闭一个方向；报文句柄总是关闭两个方向。返回值为本次是否使连接完全关闭。
    async fn close(&self, direction: ShutdownDirection) -> bool {
        let direction = match TransportSelector::close_semantics(self.family) {
            CloseSemantics::HalfClose => direction,
            CloseSemantics::WholeHandle => ShutdownDirection::Both,
        };
        let transition = self.half.close(direction);

        match &self.io {
            Io::Stream {
                writer, control, ..
            } => {
                if transition.closed_now(ShutdownDirection::Write) {
                    self.shutdown_writer(writer, control).await;
                    self.info(ConnState::CloseWrite);
                }
                if transition.closed_now(ShutdownDirection::Read) {
                    shutdown_control(control, Shutdown::Read);
                    self.info(ConnState::CloseRead);
                }
            }
            Io::Datagram { socket, .. } => {
                if transition.became_fully_closed() {
                    socket.store(None);
                    self.info(ConnState::CloseWrite);
                    self.info(ConnState::CloseRead);
                }
            }
        }

        if transition.became_fully_closed() {
            self.cancellation.cancel();
            return true;
        }
        false
    }

    async fn shutdown_writer(
        &self,
        writer: &AsyncMutex<Option<BoxedWrite>>,
        control: &Mutex<Option<socket2::Socket>>,
    ) {
        let Ok(mut guard) = writer.try_lock() else {
            // 另一个写操作仍持有写半部：直接在控制套接字上关闭写方向以唤醒它。
            shutdown_control(control, Shutdown::Write);
            return;
        };
        if let Some(mut stream) = guard.take() {
            match tokio::time::timeout(WRITE_SHUTDOWN_TIMEOUT, stream.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if spark_socket_core::is_closed_connection(&err) => {}
                Ok(Err(err)) => {
                    let err = SocketError::io(OperationKind::SHUTDOWN, err);
                    self.report(&err);
                    shutdown_control(control, Shutdown::Write);
                }
                Err(_) => shutdown_control(control, Shutdown::Write),
            }
        }
    }

    async fn hard_close(&self) -> bool {
        if self.hard_closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close(ShutdownDirection::Both).await;
        if let Io::Stream {
            reader, control, ..
        } = &self.io
        {
            shutdown_control(control, Shutdown::Both);
            control.lock().take();
            if let Ok(mut guard) = reader.try_lock() {
                guard.take();
            }
        }
        self.info(ConnState::Close);
        tracing::debug!(network = %self.family, peer = %self.remote, "connection closed");
        true
    }

    fn is_alive(&self) -> bool {
        if self.cancellation.is_cancelled() {
            return false;
        }
        match &self.io {
            Io::Stream { control, .. } => match control.lock().as_ref() {
                Some(socket) => match socket.send(&[]) {
                    Ok(_) => true,
                    Err(err) => err.kind() == io::ErrorKind::WouldBlock,
                },
                None => !self.half.load().write_closed(),
            },
            Io::Datagram { socket, .. } => match socket.load().as_ref() {
                Some(socket) => matches!(socket.take_error(), Ok(None)),
                None => false,
            },
        }
    }
}

fn shutdown_control(control: &Mutex<Option<socket2::Socket>>, how: Shutdown) {
    if let Some(socket) = control.lock().as_ref()
        && let Err(err) = socket.shutdown(how)
        && !spark_socket_core::is_closed_connection(&err)
    {
        tracing::trace!(error = %err, ?how, "control socket shutdown failed");
    }
}

/// 一条连接（或一个报文关联）。
///
/// 克隆代价很低，所有副本共享同一句柄与上下文。
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

impl Connection {
    pub(crate) fn from_stream(
        family: NetworkFamily,
        parts: StreamParts,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self::build(
            family,
            Io::Stream {
                reader: AsyncMutex::new(Some(parts.read)),
                writer: AsyncMutex::new(Some(parts.write)),
                control: Mutex::new(parts.control),
            },
            parts.local,
            parts.remote,
            callbacks,
        )
    }

    pub(crate) fn from_datagram(
        family: NetworkFamily,
        socket: DatagramSocket,
        connected: bool,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        let local = socket.local_label();
        let remote = if connected {
            socket.peer_label()
        } else {
            PeerAddr::Unknown
        };
        Self::build(
            family,
            Io::Datagram {
                socket: ArcSwapOption::from_pointee(socket),
                connected,
                last_peer: Mutex::new(None),
            },
            local,
            remote,
            callbacks,
        )
    }

    fn build(
        family: NetworkFamily,
        io: Io,
        local: PeerAddr,
        remote: PeerAddr,
        callbacks: Arc<CallbackRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(ConnShared {
                io,
                family,
                cancellation: Cancellation::new(),
                half: AtomicHalfClose::new(),
                callbacks,
                local,
                remote,
                opened_at: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                hard_closed: AtomicBool::new(false),
            }),
        }
    }

    /// 读能力对象。
    pub fn reader(&self) -> Reader {
        Reader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// 写能力对象。
    pub fn writer(&self) -> Writer {
        Writer {
            shared: Arc::clone(&self.shared),
        }
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read(buf).await
    }

    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.write(buf).await
    }

    /// 强制关闭两个方向并释放句柄；只有首次调用返回 `true`。
    pub async fn close(&self) -> bool {
        self.shared.hard_close().await
    }

    pub async fn close_read(&self) -> bool {
        self.shared.close(ShutdownDirection::Read).await
    }

    pub async fn close_write(&self) -> bool {
        self.shared.close(ShutdownDirection::Write).await
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    /// 共享上下文取消后返回。
    pub async fn done(&self) {
        self.shared.cancellation.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.shared.cancellation.is_cancelled()
    }

    pub fn half_close_state(&self) -> HalfCloseState {
        self.shared.half.load()
    }

    pub fn family(&self) -> NetworkFamily {
        self.shared.family
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.shared.local
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.shared.remote
    }

    /// 距最近一次成功读写的时长。
    pub fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    pub(crate) fn cancellation(&self) -> &Cancellation {
        &self.shared.cancellation
    }

    pub(crate) fn info(&self, state: ConnState) {
        self.shared.info(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("family", &self.shared.family)
            .field("local", &self.shared.local)
            .field("remote", &self.shared.remote)
            .field("state", &self.shared.half.load())
            .finish()
    }
}

/// 连接的读能力。
#[derive(Clone)]
pub struct Reader {
    shared: Arc<ConnShared>,
}

impl Reader {
    /// 读取一次，返回读到的字节数；`Ok(0)` 表示对端已关闭写方向。
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.shared.read(buf).await
    }

    /// 关闭读方向；写方向也已关闭时取消共享上下文并返回 `true`。
    pub async fn close(&self) -> bool {
        self.shared.close(ShutdownDirection::Read).await
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub async fn done(&self) {
        self.shared.cancellation.cancelled().await
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.shared.local
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.shared.remote
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("remote", &self.shared.remote)
            .field("state", &self.shared.half.load())
            .finish()
    }
}

/// 连接的写能力。
#[derive(Clone)]
pub struct Writer {
    shared: Arc<ConnShared>,
}

impl Writer {
    /// 流式连接写完整个缓冲区并刷新；报文连接发送一个报文。
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        self.shared.write(buf).await
    }

    /// 关闭写方向；读方向也已关闭时取消共享上下文并返回 `true`。
    pub async fn close(&self) -> bool {
        self.shared.close(ShutdownDirection::Write).await
    }

    pub fn is_alive(&self) -> bool {
        self.shared.is_alive()
    }

    pub async fn done(&self) {
        self.shared.cancellation.cancelled().await
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.shared.local
    }

    pub fn peer_addr(&self) -> &PeerAddr {
        &self.shared.remote
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("remote", &self.shared.remote)
            .field("state", &self.shared.half.load())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream;

    fn unix_pair(callbacks: Arc<CallbackRegistry>) -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let control = socket2::SockRef::from(&ours).try_clone().ok();
        let (read, write) = ours.into_split();
        let conn = Connection::from_stream(
            NetworkFamily::Unix,
            StreamParts {
                read: Box::new(read),
                write: Box::new(write),
                control,
                local: PeerAddr::Unix(None),
                remote: PeerAddr::Unix(None),
            },
            callbacks,
        );
        (conn, theirs)
    }

    #[tokio::test]
    async fn half_close_keeps_other_direction_usable() {
        let (conn, mut peer) = unix_pair(Arc::new(CallbackRegistry::default()));
        let reader = conn.reader();
        let writer = conn.writer();

        assert!(!writer.close().await);
        assert!(!conn.is_done());

        let mut eof = [0u8; 1];
        assert_eq!(peer.read(&mut eof).await.unwrap(), 0);

        peer.write_all(b"late").await.unwrap();
        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");

        assert!(reader.close().await);
        assert!(conn.is_done());
        assert_eq!(conn.half_close_state(), HalfCloseState::BothClosed);
    }

    #[tokio::test]
    async fn cancelled_connection_fails_fast() {
        let (conn, _peer) = unix_pair(Arc::new(CallbackRegistry::default()));
        let reader = conn.reader();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            reader.read(&mut buf).await
        });
        tokio::task::yield_now().await;
        conn.cancellation().cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SocketError::Cancelled { .. })));

        let err = conn.writer().write(b"x").await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(conn.half_close_state().write_closed());
    }

    #[tokio::test]
    async fn hard_close_runs_once() {
        let (conn, _peer) = unix_pair(Arc::new(CallbackRegistry::default()));
        assert!(conn.is_alive());
        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(!conn.is_alive());
        assert!(matches!(
            conn.reader().read(&mut [0u8; 1]).await,
            Err(SocketError::Cancelled { .. })
        ));
    }

    #[tokio::test]
    async fn datagram_close_closes_both_directions() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = Connection::from_datagram(
            NetworkFamily::Udp,
            DatagramSocket::Udp(socket),
            false,
            Arc::new(CallbackRegistry::default()),
        );
        assert!(matches!(
            conn.writer().write(b"x").await,
            Err(SocketError::UnknownPeer)
        ));
        assert!(conn.reader().close().await);
        assert!(conn.is_done());
        assert_eq!(conn.half_close_state(), HalfCloseState::BothClosed);
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(24))]

        /// 任意顺序的半关闭：上下文取消当且仅当两个方向都已关闭。
        #[test]
        fn context_cancelled_iff_both_directions_closed(
            ops in proptest::collection::vec(proptest::bool::ANY, 1..6)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (conn, _peer) = unix_pair(Arc::new(CallbackRegistry::default()));
                let (mut read_closed, mut write_closed) = (false, false);
                for close_read in ops {
                    if close_read {
                        conn.reader().close().await;
                        read_closed = true;
                    } else {
                        conn.writer().close().await;
                        write_closed = true;
                    }
                    assert_eq!(conn.is_done(), read_closed && write_closed);
                    assert_eq!(conn.half_close_state().read_closed(), read_closed);
                    assert_eq!(conn.half_close_state().write_closed(), write_closed);
                }
            });
        }
    }
}
