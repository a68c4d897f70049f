//! 传输选择器：按网络族提供监听、拨号与关闭语义。

use std::{io, net::SocketAddr, sync::Arc};

use socket2::SockRef;
use spark_socket_core::{
    EndpointAddress, NetworkFamily, OperationKind, PeerAddr, Result, SocketError,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener, UnixStream},
};

use crate::{
    callback::CallbackRegistry,
    conn::{Connection, DatagramSocket, StreamParts, unix_label},
    context::{CallContext, run_with_context},
    tls::ClientTls,
    unix_fs::{self, SocketFileGuard},
};

/// 关闭语义：流式句柄支持半关闭，报文句柄只能整体关闭。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseSemantics {
    HalfClose,
    WholeHandle,
}

/// 已绑定的监听端。Unix 变体携带文件守卫，监听端释放时删除套接字文件。
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    Unix {
        listener: UnixListener,
        file: SocketFileGuard,
    },
    Udp(UdpSocket),
    UnixDatagram {
        socket: UnixDatagram,
        file: SocketFileGuard,
    },
}

impl BoundListener {
    pub fn family(&self) -> NetworkFamily {
        match self {
            BoundListener::Tcp(_) => NetworkFamily::Tcp,
            BoundListener::Unix { .. } => NetworkFamily::Unix,
            BoundListener::Udp(_) => NetworkFamily::Udp,
            BoundListener::UnixDatagram { .. } => NetworkFamily::UnixDatagram,
        }
    }

    /// 实际绑定的本地地址（例如临时端口）。
    pub fn local_addr(&self) -> PeerAddr {
        let label = match self {
            BoundListener::Tcp(listener) => listener.local_addr().map(PeerAddr::from),
            BoundListener::Udp(socket) => socket.local_addr().map(PeerAddr::from),
            BoundListener::Unix { listener, .. } => {
                listener.local_addr().map(|addr| unix_label(&addr))
            }
            BoundListener::UnixDatagram { socket, .. } => {
                socket.local_addr().map(|addr| unix_label(&addr))
            }
        };
        label.unwrap_or(PeerAddr::Unknown)
    }

    /// 监听端的套接字引用，用于观察者回调（报文服务端只有这一个句柄）。
    pub fn sock_ref(&self) -> SockRef<'_> {
        match self {
            BoundListener::Tcp(listener) => SockRef::from(listener),
            BoundListener::Unix { listener, .. } => SockRef::from(listener),
            BoundListener::Udp(socket) => SockRef::from(socket),
            BoundListener::UnixDatagram { socket, .. } => SockRef::from(socket),
        }
    }
}

/// accept 得到的流。
#[derive(Debug)]
pub(crate) enum AcceptedStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AcceptedStream {
    pub(crate) fn sock_ref(&self) -> SockRef<'_> {
        match self {
            AcceptedStream::Tcp(stream) => SockRef::from(stream),
            AcceptedStream::Unix(stream) => SockRef::from(stream),
        }
    }

    pub(crate) fn peer_label(&self) -> PeerAddr {
        match self {
            AcceptedStream::Tcp(stream) => stream
                .peer_addr()
                .map_or(PeerAddr::Unknown, PeerAddr::from),
            AcceptedStream::Unix(stream) => stream
                .peer_addr()
                .map_or(PeerAddr::Unknown, |addr| unix_label(&addr)),
        }
    }
}

/// 流式 accept 端。
pub(crate) enum StreamAcceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl StreamAcceptor {
    pub(crate) async fn accept(&self) -> io::Result<AcceptedStream> {
        match self {
            StreamAcceptor::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(AcceptedStream::Tcp(stream))
            }
            StreamAcceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(AcceptedStream::Unix(stream))
            }
        }
    }
}

/// 按网络族分派的传输原语。
#[derive(Clone, Copy, Debug, Default)]
pub struct TransportSelector;

impl TransportSelector {
    pub fn close_semantics(family: NetworkFamily) -> CloseSemantics {
        if family.supports_half_close() {
            CloseSemantics::HalfClose
        } else {
            CloseSemantics::WholeHandle
        }
    }

    /// 绑定监听端。Unix 变体经由 [`unix_fs::bind_with_permissions`] 处理残留文件、umask 与权限修正。
    pub async fn listen(endpoint: &EndpointAddress) -> Result<BoundListener> {
        endpoint.validate_for_listen()?;
        let bind_err = |err: io::Error| SocketError::io(OperationKind::BIND, err);
        match endpoint.family() {
            NetworkFamily::Tcp => TcpListener::bind(endpoint.listen_target())
                .await
                .map(BoundListener::Tcp)
                .map_err(bind_err),
            NetworkFamily::Udp => UdpSocket::bind(endpoint.listen_target())
                .await
                .map(BoundListener::Udp)
                .map_err(bind_err),
            NetworkFamily::Unix => {
                let (listener, file) =
                    unix_fs::bind_with_permissions(endpoint, |path| UnixListener::bind(path))?;
                Ok(BoundListener::Unix { listener, file })
            }
            NetworkFamily::UnixDatagram => {
                let (socket, file) =
                    unix_fs::bind_with_permissions(endpoint, |path| UnixDatagram::bind(path))?;
                Ok(BoundListener::UnixDatagram { socket, file })
            }
        }
    }

    /// 拨号（流式）或关联（报文），返回一条新连接。TLS 仅对 TCP 生效。
    pub(crate) async fn dial(
        endpoint: &EndpointAddress,
        ctx: &CallContext,
        tls: Option<&ClientTls>,
        callbacks: Arc<CallbackRegistry>,
    ) -> Result<Connection> {
        endpoint.validate_for_dial()?;
        let family = endpoint.family();
        match family {
            NetworkFamily::Tcp => {
                let stream = run_with_context(
                    ctx,
                    OperationKind::CONNECT,
                    TcpStream::connect(endpoint.address()),
                )
                .await?;
                let control = SockRef::from(&stream).try_clone().ok();
                let local = stream.local_addr().map_or(PeerAddr::Unknown, PeerAddr::from);
                let remote = stream.peer_addr().map_or(PeerAddr::Unknown, PeerAddr::from);
                let parts = match tls {
                    Some(tls) => {
                        let handshake = tls.connect(stream);
                        let stream = run_with_context(ctx, OperationKind::HANDSHAKE, handshake)
                            .await
                            .map_err(into_handshake_error)?;
                        split_parts(stream, control, local, remote)
                    }
                    None => {
                        let (read, write) = stream.into_split();
                        boxed_parts(read, write, control, local, remote)
                    }
                };
                Ok(Connection::from_stream(family, parts, callbacks))
            }
            NetworkFamily::Unix => {
                let stream = run_with_context(
                    ctx,
                    OperationKind::CONNECT,
                    UnixStream::connect(endpoint.address()),
                )
                .await?;
                let control = SockRef::from(&stream).try_clone().ok();
                let local = stream.local_addr().map_or(PeerAddr::Unknown, |a| unix_label(&a));
                let remote = stream.peer_addr().map_or(PeerAddr::Unknown, |a| unix_label(&a));
                let (read, write) = stream.into_split();
                Ok(Connection::from_stream(
                    family,
                    boxed_parts(read, write, control, local, remote),
                    callbacks,
                ))
            }
            NetworkFamily::Udp => {
                let socket = run_with_context(ctx, OperationKind::CONNECT, async {
                    let target = resolve(endpoint.address()).await?;
                    let local: SocketAddr = if target.is_ipv4() {
                        ([0, 0, 0, 0], 0).into()
                    } else {
                        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                    };
                    let socket = UdpSocket::bind(local).await?;
                    socket.connect(target).await?;
                    Ok(socket)
                })
                .await?;
                Ok(Connection::from_datagram(
                    family,
                    DatagramSocket::Udp(socket),
                    true,
                    callbacks,
                ))
            }
            NetworkFamily::UnixDatagram => {
                let socket = UnixDatagram::unbound()
                    .and_then(|socket| socket.connect(endpoint.address()).map(|()| socket))
                    .map_err(|err| SocketError::io(OperationKind::CONNECT, err))?;
                Ok(Connection::from_datagram(
                    family,
                    DatagramSocket::Unix(socket),
                    true,
                    callbacks,
                ))
            }
        }
    }
}

async fn resolve(address: &str) -> io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address resolved for {address}"),
        )
    })
}

fn into_handshake_error(err: SocketError) -> SocketError {
    match err {
        SocketError::Io { source, .. } => SocketError::Handshake { source },
        other => other,
    }
}

pub(crate) fn boxed_parts<R, W>(
    read: R,
    write: W,
    control: Option<socket2::Socket>,
    local: PeerAddr,
    remote: PeerAddr,
) -> StreamParts
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    StreamParts {
        read: Box::new(read),
        write: Box::new(write),
        control,
        local,
        remote,
    }
}

/// 拆分被 TLS 包裹的流。
pub(crate) fn split_parts<S>(
    stream: S,
    control: Option<socket2::Socket>,
    local: PeerAddr,
    remote: PeerAddr,
) -> StreamParts
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    boxed_parts(read, write, control, local, remote)
}
