//! TCP 上的 TLS：自签名证书回显与配置校验。

mod support;

use std::{sync::Arc, time::Duration};

use rcgen::CertifiedKey;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_socket::{
    CallContext, ClientConfig, ErrorCategory, NetworkFamily, ServerConfig, SocketClient,
    SocketError, SocketServer,
};

fn tls_material() -> anyhow::Result<(Arc<rustls::ServerConfig>, Arc<rustls::ClientConfig>)> {
    support::install_crypto_provider();
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)?;
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der)?;
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok((Arc::new(server), Arc::new(client)))
}

#[tokio::test(flavor = "multi_thread")]
async fn tls_echo_round_trip() -> anyhow::Result<()> {
    let (server_tls, client_tls) = tls_material()?;
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(support::echo)
        .tls(&server_tls)
        .build()?;
    assert!(server.tls_active());
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;

    let mut config = ClientConfig::new(NetworkFamily::Tcp, support::inet_addr(&server));
    config.server_name = Some("localhost".to_owned());
    let client = SocketClient::new(config)?;
    client.set_tls(true, Some(&client_tls), None)?;
    assert!(client.tls_active());

    client
        .connect(&CallContext::with_timeout(Duration::from_secs(5)))
        .await?;
    client.write(b"secret").await?;
    assert_eq!(support::read_exact(&client, 6).await, b"secret");
    client.close().await?;

    server.shutdown(&CallContext::background()).await?;
    running.await??;
    assert_eq!(server.open_connections(), 0);
    Ok(())
}

/// 握手失败只影响该连接，服务端继续服务明文之外的后续 TLS 连接。
#[tokio::test(flavor = "multi_thread")]
async fn plaintext_client_fails_handshake_without_killing_server() -> anyhow::Result<()> {
    let (server_tls, client_tls) = tls_material()?;
    let server = SocketServer::builder()
        .config(
            ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0").with_drain(support::short_drain()),
        )
        .handler(support::echo)
        .tls(&server_tls)
        .build()?;
    let errors = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    server.on_error(move |reported| {
        sink.lock().unwrap().extend(reported.iter().map(SocketError::category));
    });
    let running = support::spawn_listen(&server);
    support::wait_running(&server).await;
    let address = support::inet_addr(&server);

    let plaintext = SocketClient::new(ClientConfig::new(NetworkFamily::Tcp, address.clone()))?;
    plaintext.connect(&CallContext::background()).await?;
    plaintext.write(b"this is not a client hello\r\n").await?;
    let mut buf = [0u8; 64];
    let _ = tokio::time::timeout(Duration::from_secs(5), plaintext.read(&mut buf)).await?;
    plaintext.close().await?;

    tokio::time::timeout(Duration::from_secs(5), async {
        while errors.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(errors.lock().unwrap()[0], ErrorCategory::Transient);

    let secure = SocketClient::new(ClientConfig::new(NetworkFamily::Tcp, address))?;
    secure.set_tls(true, Some(&client_tls), Some("localhost"))?;
    secure.connect(&CallContext::background()).await?;
    secure.write(b"ok").await?;
    assert_eq!(support::read_exact(&secure, 2).await, b"ok");
    secure.close().await?;

    server.shutdown(&CallContext::background()).await?;
    running.await??;
    Ok(())
}

#[test]
fn tls_configuration_is_validated() -> anyhow::Result<()> {
    let (server_tls, client_tls) = tls_material()?;

    let server = SocketServer::new(ServerConfig::new(NetworkFamily::Tcp, "127.0.0.1:0"))?;
    assert!(matches!(
        server.set_tls(true, None),
        Err(SocketError::InvalidTlsConfig(_))
    ));
    // 客户端配置不能用于服务端。
    assert!(matches!(
        server.set_tls(true, Some(&client_tls)),
        Err(SocketError::InvalidTlsConfig(_))
    ));
    server.set_tls(true, Some(&server_tls))?;
    assert!(server.tls_active());
    server.set_tls(false, None)?;
    assert!(!server.tls_active());

    // 非 TCP 服务端接受调用但 TLS 不生效。
    let unix = SocketServer::new(ServerConfig::new(NetworkFamily::Unix, "/tmp/spark-tls.sock"))?;
    unix.set_tls(true, Some(&server_tls))?;
    assert!(!unix.tls_active());

    let client = SocketClient::new(ClientConfig::new(NetworkFamily::Tcp, "127.0.0.1:443"))?;
    assert!(matches!(
        client.set_tls(true, Some(&client_tls), Some("not a valid name!")),
        Err(SocketError::InvalidTlsConfig(_))
    ));
    Ok(())
}
