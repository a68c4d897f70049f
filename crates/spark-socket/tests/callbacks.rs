//! 回调与 Handler 的故障隔离。
//!
//! # 教案式说明
//! - **Why**：回调与 Handler 都是外部代码，它们的 panic 不能拖垮 accept 循环或后续连接。
//! - **How**：注册总是 panic 的错误回调、首次调用即 panic 的 Handler，以及拒绝首条连接的观察者。
//! - **What**：后续连接照常回显，panic 计数可被观察到。

mod support;

use std::{
    io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use spark_socket::{
    CallContext, ClientConfig, ConnState, NetworkFamily, Reader, ServerConfig, SocketClient,
    SocketServer, Writer,
};

async fn echo_round_trip(server: &SocketServer, payload: &[u8]) {
    let client = SocketClient::new(ClientConfig::new(
        NetworkFamily::Tcp,
        support::inet_addr(server),
    ))
    .expect("构建客户端失败");
    client.connect(&CallContext::background()).await.expect("连接失败");
    client.write(payload).await.expect("写入失败");
    assert_eq!(support::read_exact(&client, payload.len()).await, payload);
    client.close().await.expect("关闭失败");
}

/// 错误回调 panic 不影响后续连接。
#[tokio::test(flavor = "multi_thread")]
async fn panicking_error_callback_is_contained() {
    let reject_first = Arc::new(AtomicBool::new(true));
    let gate = Arc::clone(&reject_first);
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(support::echo)
        .observer(move |socket| {
            if gate.swap(false, Ordering::SeqCst) {
                return Err(io::Error::other("first connection rejected"));
            }
            socket.set_keepalive(true)
        })
        .build()
        .expect("构建服务端失败");
    server.on_error(|_| panic!("error callback exploded"));
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    // 首条连接被观察者拒绝，错误回调随之 panic。
    let rejected = SocketClient::new(ClientConfig::new(
        NetworkFamily::Tcp,
        support::inet_addr(&server),
    ))
    .expect("构建客户端失败");
    rejected.connect(&CallContext::background()).await.expect("连接失败");
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_secs(5), rejected.read(&mut buf))
        .await
        .expect("被拒绝的连接未被关闭");
    assert!(matches!(read, Ok(0) | Err(_)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while server.callbacks().panicked_callbacks() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("错误回调未被调用");

    echo_round_trip(&server, b"still alive").await;
    echo_round_trip(&server, b"and again").await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// Handler panic 只影响本条连接：连接被拆除，计数回到 0，服务端继续接受新连接。
#[tokio::test(flavor = "multi_thread")]
async fn panicking_handler_is_contained() {
    let explode = Arc::new(AtomicBool::new(true));
    let trigger = Arc::clone(&explode);
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(move |reader: Reader, writer: Writer| {
            let explode = trigger.swap(false, Ordering::SeqCst);
            async move {
                if explode {
                    panic!("handler exploded");
                }
                support::echo(reader, writer).await;
            }
        })
        .build()
        .expect("构建服务端失败");
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let doomed = SocketClient::new(ClientConfig::new(
        NetworkFamily::Tcp,
        support::inet_addr(&server),
    ))
    .expect("构建客户端失败");
    doomed.connect(&CallContext::background()).await.expect("连接失败");
    let mut buf = [0u8; 4];
    let read = tokio::time::timeout(Duration::from_secs(5), doomed.read(&mut buf))
        .await
        .expect("panic 的连接未被关闭");
    assert!(matches!(read, Ok(0) | Err(_)));
    support::wait_for_open(&server, 0).await;

    echo_round_trip(&server, b"recovered").await;

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}

/// 信息回调按生命周期顺序收到连接状态。
#[tokio::test(flavor = "multi_thread")]
async fn info_callback_follows_connection_lifecycle() {
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(support::echo)
        .build()
        .expect("构建服务端失败");
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    server.on_info(move |_, _, state| sink.lock().unwrap().push(state));
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    echo_round_trip(&server, b"trace").await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !states.lock().unwrap().contains(&ConnState::Close) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("未收到 Close 状态");

    let states = states.lock().unwrap().clone();
    let position = |wanted: ConnState| {
        states
            .iter()
            .position(|state| *state == wanted)
            .unwrap_or_else(|| panic!("缺少状态 {wanted}: {states:?}"))
    };
    assert!(position(ConnState::New) < position(ConnState::Read));
    assert!(position(ConnState::Read) < position(ConnState::Write));
    assert!(position(ConnState::CloseRead) < position(ConnState::Close));
    assert!(position(ConnState::CloseWrite) < position(ConnState::Close));
    assert_eq!(states.last(), Some(&ConnState::Close));

    server.shutdown(&CallContext::background()).await.expect("关停失败");
    running.await.expect("listen 任务 panic").expect("listen 返回错误");
}
