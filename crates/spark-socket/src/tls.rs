use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls_pki_types::ServerName;
use spark_socket_core::{Result, SocketError};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector, client, server};

/// 能够产出 TLS 配置的不透明对象。
///
/// # 教案级注释
///
/// - **意图 (Why)**：证书与配置的来源（文件、密钥管理服务、热更新容器）不属于传输层，
///   传输层只需要在 `set_tls` 时取到一份 `rustls` 配置；
/// - **契约 (What)**：服务端只调用 [`server_config`](Self::server_config)，
///   客户端只调用 [`client_config`](Self::client_config)；返回 `None` 表示该来源不支持对应角色。
pub trait TlsConfigSource: Send + Sync {
    fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        None
    }

    fn client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        None
    }
}

impl TlsConfigSource for Arc<rustls::ServerConfig> {
    fn server_config(&self) -> Option<Arc<rustls::ServerConfig>> {
        Some(Arc::clone(self))
    }
}

impl TlsConfigSource for Arc<rustls::ClientConfig> {
    fn client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        Some(Arc::clone(self))
    }
}

/// 服务端 TLS 状态，可在运行中替换（证书热更新）。
#[derive(Default)]
pub(crate) struct ServerTls {
    config: ArcSwapOption<rustls::ServerConfig>,
}

impl ServerTls {
    pub(crate) fn configure(
        &self,
        enable: bool,
        source: Option<&dyn TlsConfigSource>,
    ) -> Result<()> {
        if !enable {
            self.config.store(None);
            return Ok(());
        }
        let config = source
            .and_then(|source| source.server_config())
            .ok_or(SocketError::InvalidTlsConfig(
                "a server configuration is required to enable tls",
            ))?;
        self.config.store(Some(config));
        Ok(())
    }

    pub(crate) fn is_active(&self) -> bool {
        self.config.load().is_some()
    }

    /// 当前配置快照对应的握手器；未启用时返回 `None`。
    pub(crate) fn acceptor(&self) -> Option<TlsAcceptor> {
        self.config.load_full().map(TlsAcceptor::from)
    }
}

impl fmt::Debug for ServerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerTls")
            .field("active", &self.is_active())
            .finish()
    }
}

pub(crate) type ServerTlsStream = server::TlsStream<TcpStream>;
pub(crate) type ClientTlsStream = client::TlsStream<TcpStream>;

/// 客户端 TLS 设置：配置 + 用于 SNI 与证书校验的服务器名。
#[derive(Clone)]
pub(crate) struct ClientTls {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub(crate) fn new(source: Option<&dyn TlsConfigSource>, server_name: &str) -> Result<Self> {
        let config = source
            .and_then(|source| source.client_config())
            .ok_or(SocketError::InvalidTlsConfig(
                "a client configuration is required to enable tls",
            ))?;
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| SocketError::InvalidTlsConfig("invalid tls server name"))?;
        Ok(Self {
            config,
            server_name,
        })
    }

    pub(crate) async fn connect(&self, stream: TcpStream) -> std::io::Result<ClientTlsStream> {
        TlsConnector::from(Arc::clone(&self.config))
            .connect(self.server_name.clone(), stream)
            .await
    }
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls")
            .field("server_name", &self.server_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;
    impl TlsConfigSource for Empty {}

    #[test]
    fn enabling_without_material_is_rejected() {
        let tls = ServerTls::default();
        assert!(matches!(
            tls.configure(true, Some(&Empty)),
            Err(SocketError::InvalidTlsConfig(_))
        ));
        assert!(matches!(
            tls.configure(true, None),
            Err(SocketError::InvalidTlsConfig(_))
        ));
        assert!(tls.configure(false, None).is_ok());
        assert!(!tls.is_active());

        assert!(matches!(
            ClientTls::new(Some(&Empty), "localhost"),
            Err(SocketError::InvalidTlsConfig(_))
        ));
    }
}
