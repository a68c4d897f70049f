//! 连接计数、拆除宽限期与空闲超时。
//!
//! # 教案式说明
//! - **Why**：计数是关停时判断“是否已排空”的唯一依据；宽限期决定对端能否读完在途数据。
//! - **How**：通过信息回调记录 `New`/`Close` 的时间点，通过关停耗时观察排空宽限期。
//! - **What**：计数在所有连接拆除后严格回到 0；宽限期不短于配置值（留出调度抖动余量）。

mod support;

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use spark_socket::{
    CallContext, ClientConfig, ConnState, DrainPolicy, NetworkFamily, Reader, ServerConfig,
    ServerPhase, SocketClient, SocketServer, Writer,
};

fn tcp_client(server: &SocketServer) -> SocketClient {
    SocketClient::new(ClientConfig::new(NetworkFamily::Tcp, support::inet_addr(server)))
        .expect("构建客户端失败")
}

/// 并发建立与关闭连接后计数回到 0。
#[tokio::test(flavor = "multi_thread")]
async fn open_connections_returns_to_zero() {
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(support::echo)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let mut clients = Vec::new();
    for _ in 0..20 {
        let client = tcp_client(&server);
        client.connect(&CallContext::background()).await.expect("连接失败");
        clients.push(client);
    }
    support::wait_for_open(&server, 20).await;

    let closers: Vec<_> = clients
        .into_iter()
        .map(|client| tokio::spawn(async move { client.close().await }))
        .collect();
    for closer in closers {
        closer.await.expect("关闭任务 panic").expect("关闭失败");
    }
    support::wait_for_open(&server, 0).await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
    assert_eq!(server.open_connections(), 0);
}

/// Handler 返回后，连接在普通宽限期结束时才关闭句柄。
#[tokio::test(flavor = "multi_thread")]
async fn handler_return_waits_idle_grace_before_close() {
    let drain = DrainPolicy::new(Duration::from_millis(600), Duration::from_millis(300));
    let server = SocketServer::builder()
        .config(ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(drain))
        .handler(|_reader, _writer| async {})
        .build()
        .expect("构建服务端失败");
    let events = Arc::new(Mutex::new(Vec::<(ConnState, Instant)>::new()));
    let sink = Arc::clone(&events);
    server.on_info(move |_, _, state| sink.lock().unwrap().push((state, Instant::now())));
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let client = tcp_client(&server);
    client.connect(&CallContext::background()).await.expect("连接失败");

    let at = |wanted: ConnState| {
        events
            .lock()
            .unwrap()
            .iter()
            .find(|(state, _)| *state == wanted)
            .map(|(_, at)| *at)
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while at(ConnState::Close).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("未观察到 Close 事件");

    let opened = at(ConnState::New).expect("缺少 New 事件");
    let closed = at(ConnState::Close).expect("缺少 Close 事件");
    assert!(
        closed.duration_since(opened) >= Duration::from_millis(250),
        "宽限期过短: {:?}",
        closed.duration_since(opened)
    );
    assert!(at(ConnState::Handler).is_some());

    client.close().await.expect("关闭失败");
    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// 关停时仍在线的连接按排空宽限期拆除，关停耗时不短于该宽限期。
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_waits_draining_grace() {
    let drain = DrainPolicy::new(Duration::from_millis(400), Duration::from_millis(20));
    let server = SocketServer::builder()
        .config(ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(drain))
        .handler(support::sink)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let client = tcp_client(&server);
    client.connect(&CallContext::background()).await.expect("连接失败");
    support::wait_for_open(&server, 1).await;

    let started = Instant::now();
    server.shutdown(&CallContext::background()).await.expect("关停失败");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(350), "排空宽限期过短: {elapsed:?}");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
    assert_eq!(server.open_connections(), 0);

    // 服务端已关闭两个方向，客户端读到 EOF。
    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("读取超时");
    assert!(matches!(read, Ok(0) | Err(_)));
}

/// 关停期限短于排空宽限期时返回 `ShutdownTimeout`，服务端随后仍会停止。
#[tokio::test(flavor = "multi_thread")]
async fn shutdown_deadline_is_enforced() {
    let drain = DrainPolicy::new(Duration::from_millis(800), Duration::from_millis(20));
    let server = SocketServer::builder()
        .config(ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(drain))
        .handler(support::sink)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let client = tcp_client(&server);
    client.connect(&CallContext::background()).await.expect("连接失败");
    support::wait_for_open(&server, 1).await;

    let err = server
        .shutdown(&CallContext::with_timeout(Duration::from_millis(100)))
        .await
        .expect_err("期限过短时应超时");
    assert!(matches!(err, spark_socket::SocketError::ShutdownTimeout));

    tokio::time::timeout(Duration::from_secs(5), server.done())
        .await
        .expect("服务端未能停止");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// 没有任何 IO 的连接在空闲超时后被拆除。
#[tokio::test(flavor = "multi_thread")]
async fn idle_connection_is_torn_down() {
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0")
                .with_idle_timeout(Duration::from_secs(1))
                .with_drain(support::short_drain()),
        )
        .handler(support::sink)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let client = tcp_client(&server);
    let started = Instant::now();
    client.connect(&CallContext::background()).await.expect("连接失败");

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("空闲连接未被拆除");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(started.elapsed() >= Duration::from_millis(900));
    support::wait_for_open(&server, 0).await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// 报文服务端只有一个关联，运行期间计数恒为 1。
#[tokio::test(flavor = "multi_thread")]
async fn datagram_server_counts_single_association() {
    let server = SocketServer::builder()
        .config(ServerConfig::new(NetworkFamily::Udp, "127.0.0.1:0"))
        .handler(support::sink)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;
    support::wait_for_open(&server, 1).await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
    assert_eq!(server.open_connections(), 0);
}

/// 忽略取消的 Handler 在拆除宽限期后被中止，服务端照常停止并可再次监听。
#[tokio::test(flavor = "multi_thread")]
async fn stuck_handler_does_not_block_shutdown() {
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0")
                .with_drain(support::short_drain())
                .with_shutdown_timeout(Duration::from_secs(2)),
        )
        .handler(|_reader: Reader, _writer: Writer| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let client = tcp_client(&server);
    client.connect(&CallContext::background()).await.expect("连接失败");
    support::wait_for_open(&server, 1).await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    assert_eq!(server.phase(), ServerPhase::Stopped);
    tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("listen 未返回")
        .expect("listen 任务 panic")
        .expect("listen 返回错误");
    assert_eq!(server.open_connections(), 0);

    let restarted = support::spawn_listen(&server);
    support::wait_running(&server).await;
    server.shutdown(&CallContext::background()).await.expect("再次关停失败");
    restarted.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// 排空期间不再接受连接：`is_running` 立即变为 `false`，`is_gone` 为 `true`。
#[tokio::test(flavor = "multi_thread")]
async fn draining_server_is_not_running() {
    let drain = DrainPolicy::new(Duration::from_millis(600), Duration::from_millis(20));
    let server = SocketServer::builder()
        .config(ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(drain))
        .handler(support::sink)
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;
    assert!(server.is_running());

    let client = tcp_client(&server);
    client.connect(&CallContext::background()).await.expect("连接失败");
    support::wait_for_open(&server, 1).await;

    let stopper = server.clone();
    let shutdown =
        tokio::spawn(async move { stopper.shutdown(&CallContext::background()).await });
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.is_gone() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("服务端未开始排空");
    assert_eq!(server.phase(), ServerPhase::Draining);
    assert!(!server.is_running());

    shutdown.await.expect("关停任务 panic").expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
    assert!(server.is_gone());
    assert!(!server.is_running());
}
