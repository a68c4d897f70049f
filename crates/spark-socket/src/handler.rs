use std::{future::Future, io, pin::Pin};

use socket2::SockRef;

use crate::conn::{Reader, Writer};

/// `'a` 生命周期内可跨线程发送的装箱 Future。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// 应用层 Handler：每条连接（或每个报文关联）调用一次，负责全部应用层分帧。
///
/// # 教案级注释
///
/// - **契约 (What)**：Handler 返回或连接上下文取消之前，`Reader`/`Writer` 始终可用；
///   Handler 返回后引擎保证关闭两个方向；
/// - **实现 (How)**：任何 `Fn(Reader, Writer) -> impl Future<Output = ()>` 闭包都自动实现本 trait。
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, reader: Reader, writer: Writer) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Reader, Writer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, reader: Reader, writer: Writer) -> BoxFuture<'static, ()> {
        Box::pin(self(reader, writer))
    }
}

/// 连接观察者：在连接包装器构建之前拿到原始套接字，用于设置截止时间、缓冲区等连接级选项。
///
/// 返回错误时该连接被丢弃，错误经错误回调上报。
pub trait ConnectionObserver: Send + Sync + 'static {
    fn observe(&self, socket: SockRef<'_>) -> io::Result<()>;
}

impl<F> ConnectionObserver for F
where
    F: for<'a> Fn(SockRef<'a>) -> io::Result<()> + Send + Sync + 'static,
{
    fn observe(&self, socket: SockRef<'_>) -> io::Result<()> {
        self(socket)
    }
}
