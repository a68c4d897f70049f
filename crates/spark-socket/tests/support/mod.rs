//! 集成测试共享的夹具：临时套接字路径、回显 Handler 与服务端启动辅助。
#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use spark_socket::{
    CallContext, DrainPolicy, PeerAddr, Reader, ServerPhase, SocketClient, SocketServer, Writer,
};
use tokio::task::JoinHandle;

/// 测试中使用的短宽限期，避免每条连接拆除都等待默认的 500 毫秒/5 秒。
pub fn short_drain() -> DrainPolicy {
    DrainPolicy::new(Duration::from_millis(100), Duration::from_millis(20))
}

/// 生成不与并行测试冲突的 Unix 套接字路径。
pub fn socket_path(tag: &str) -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::env::temp_dir().join(format!(
        "spark-{tag}-{}-{}.sock",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ))
}

pub fn path_str(path: &std::path::Path) -> String {
    path.to_str().expect("临时路径应为 UTF-8").to_owned()
}

/// 回显 Handler：读到什么写回什么，直到对端关闭写方向或上下文取消。
pub async fn echo(reader: Reader, writer: Writer) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => {
                if writer.write(&buf[..read]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// 持续读取直到对端关闭或出错，不做任何应答。
pub async fn sink(reader: Reader, _writer: Writer) {
    let mut buf = vec![0u8; 4096];
    while let Ok(read) = reader.read(&mut buf).await {
        if read == 0 {
            break;
        }
    }
}

/// 在后台运行 `listen`。
pub fn spawn_listen(server: &SocketServer) -> JoinHandle<spark_socket::Result<()>> {
    let server = server.clone();
    tokio::spawn(async move { server.listen(&CallContext::background()).await })
}

pub async fn wait_running(server: &SocketServer) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.phase() != ServerPhase::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("服务端未在 5 秒内进入 Running");
}

pub async fn wait_for_open(server: &SocketServer, expected: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.open_connections() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "在线连接数未收敛到 {expected}，当前为 {}",
            server.open_connections()
        )
    });
}

/// 运行中服务端的 `host:port`。
pub fn inet_addr(server: &SocketServer) -> String {
    match server.local_addr() {
        Some(PeerAddr::Inet(addr)) => addr.to_string(),
        other => panic!("服务端未绑定 IP 地址: {other:?}"),
    }
}

/// 从客户端读满 `len` 字节。
pub async fn read_exact(client: &SocketClient, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; len];
    while out.len() < len {
        let remaining = len - out.len();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf[..remaining]))
            .await
            .expect("读取超时")
            .expect("读取失败");
        assert_ne!(read, 0, "对端提前关闭");
        out.extend_from_slice(&buf[..read]);
    }
    out
}

pub fn install_crypto_provider() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
