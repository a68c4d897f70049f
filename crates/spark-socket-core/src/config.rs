//! 声明式配置。
//!
//! # 教案级说明
//!
//! - **意图（Why）**：服务端与客户端都可以从 TOML 片段构造，运维侧只需维护一份文本；
//!   `validate` 在创建任何套接字之前把配置错误暴露出来。
//! - **契约（What）**：所有时长字段以毫秒表示；权限位以八进制字符串书写（如 `"0660"`），
//!   属组 ID 不超过 [`UnixPermissions::MAX_GID`]；未出现的字段取默认值。
//! - **取舍（Trade-offs）**：宽限期是启发式参数而非正确性保证，因此开放为可调项，
//!   默认值保持 5 秒/500 毫秒。

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    addr::{EndpointAddress, NetworkFamily, UnixPermissions},
    error::SocketError,
};

const DEFAULT_CALLBACK_QUEUE: usize = 1024;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
const MIN_IDLE_TIMEOUT_MS: u64 = 1_000;

/// 连接拆除时，关闭写方向与关闭读方向之间的宽限期。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainPolicy {
    /// 服务端处于排空阶段时的宽限期。
    pub draining_ms: u64,
    /// 普通拆除（连接自行结束）时的宽限期。
    pub idle_ms: u64,
}

impl DrainPolicy {
    pub const fn new(draining: Duration, idle: Duration) -> Self {
        Self {
            draining_ms: draining.as_millis() as u64,
            idle_ms: idle.as_millis() as u64,
        }
    }

    pub const fn draining(&self) -> Duration {
        Duration::from_millis(self.draining_ms)
    }

    pub const fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    /// 按服务端是否处于排空阶段选择宽限期。
    pub const fn grace(&self, draining: bool) -> Duration {
        if draining { self.draining() } else { self.idle() }
    }
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            draining_ms: 5_000,
            idle_ms: 500,
        }
    }
}

/// 服务端配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub network: NetworkFamily,
    pub address: String,
    /// Unix 套接字文件权限（八进制字符串），缺省为 `0660`。
    #[serde(default)]
    pub permissions: Option<String>,
    /// Unix 套接字文件属组。
    #[serde(default)]
    pub group: Option<u32>,
    /// 连接空闲超时；仅对流式传输生效，取值不得低于 1 秒。
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub drain: DrainPolicy,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_callback_queue")]
    pub callback_queue: usize,
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_callback_queue() -> usize {
    DEFAULT_CALLBACK_QUEUE
}

impl ServerConfig {
    pub fn new(network: NetworkFamily, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            permissions: None,
            group: None,
            idle_timeout_ms: None,
            drain: DrainPolicy::default(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            callback_queue: DEFAULT_CALLBACK_QUEUE,
        }
    }

    /// 从 TOML 文本加载。
    pub fn from_toml_str(text: &str) -> Result<Self, SocketError> {
        toml::from_str(text).map_err(|err| SocketError::InvalidConfig(err.message().to_owned()))
    }

    pub fn with_permissions(mut self, mode: impl Into<String>, group: Option<u32>) -> Self {
        self.permissions = Some(mode.into());
        self.group = group;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_drain(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 校验配置并生成监听端点。
    pub fn validate(&self) -> Result<EndpointAddress, SocketError> {
        let mode = match &self.permissions {
            Some(text) => UnixPermissions::parse_mode(text)?,
            None => UnixPermissions::DEFAULT_MODE,
        };
        let permissions = UnixPermissions::new(mode, self.group)?;
        let endpoint =
            EndpointAddress::new(self.network, self.address.clone()).with_permissions(permissions);
        endpoint.validate_for_listen()?;
        check_unix_path(&endpoint)?;

        if let Some(idle) = self.idle_timeout_ms
            && idle < MIN_IDLE_TIMEOUT_MS
        {
            return Err(SocketError::InvalidConfig(format!(
                "idle_timeout_ms must be at least {MIN_IDLE_TIMEOUT_MS}, got {idle}"
            )));
        }
        if self.callback_queue == 0 {
            return Err(SocketError::InvalidConfig(
                "callback_queue must be positive".to_owned(),
            ));
        }
        Ok(endpoint)
    }
}

/// 客户端配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub network: NetworkFamily,
    pub address: String,
    /// 启用 TLS 时用于 SNI 与证书校验的服务器名。
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default = "default_callback_queue")]
    pub callback_queue: usize,
}

impl ClientConfig {
    pub fn new(network: NetworkFamily, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
            server_name: None,
            callback_queue: DEFAULT_CALLBACK_QUEUE,
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, SocketError> {
        toml::from_str(text).map_err(|err| SocketError::InvalidConfig(err.message().to_owned()))
    }

    /// 校验配置并生成拨号端点。
    pub fn validate(&self) -> Result<EndpointAddress, SocketError> {
        let endpoint = EndpointAddress::new(self.network, self.address.clone());
        endpoint.validate_for_dial()?;
        check_unix_path(&endpoint)?;
        if self.callback_queue == 0 {
            return Err(SocketError::InvalidConfig(
                "callback_queue must be positive".to_owned(),
            ));
        }
        Ok(endpoint)
    }
}

fn check_unix_path(endpoint: &EndpointAddress) -> Result<(), SocketError> {
    match endpoint.unix_path() {
        Some(path) if !Path::is_absolute(path) => Err(SocketError::InvalidAddress {
            address: endpoint.address().to_owned(),
            reason: "unix socket path must be absolute",
        }),
        _ => Ok(()),
    }
}
