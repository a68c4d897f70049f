use std::{
    fmt,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::SocketError;

/// 传输层支持的网络族。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让服务端与客户端引擎在同一处判定“是否面向流”“是否支持半关闭”“是否需要管理套接字文件”，
///   避免各实现散落 `match` 字符串；
/// - 解析时兼容 `tcp4`/`tcp6`/`udp4`/`udp6` 等别名，它们在本层只影响地址解析而不影响语义。
///
/// ## 契约（What）
/// - `Tcp`、`Unix` 为流式传输，支持读/写方向独立关闭；
/// - `Udp`、`UnixDatagram` 为报文传输，关闭任一方向即关闭整个句柄；
/// - 仅 `Tcp` 支持在套接字层叠加 TLS；
/// - 仅 `Unix`、`UnixDatagram` 在文件系统中占用路径并需要权限/属组控制。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NetworkFamily {
    /// 面向连接的 TCP。
    Tcp,
    /// 无连接的 UDP。
    Udp,
    /// Unix 域流式套接字。
    Unix,
    /// Unix 域报文套接字。
    UnixDatagram,
}

impl NetworkFamily {
    /// 返回稳定的协议标识。
    pub const fn scheme(self) -> &'static str {
        match self {
            NetworkFamily::Tcp => "tcp",
            NetworkFamily::Udp => "udp",
            NetworkFamily::Unix => "unix",
            NetworkFamily::UnixDatagram => "unixgram",
        }
    }

    /// 是否为流式传输。
    pub const fn is_stream(self) -> bool {
        matches!(self, NetworkFamily::Tcp | NetworkFamily::Unix)
    }

    /// 是否为报文传输。
    pub const fn is_datagram(self) -> bool {
        !self.is_stream()
    }

    /// 是否为 Unix 域套接字（需要管理文件系统路径）。
    pub const fn is_unix(self) -> bool {
        matches!(self, NetworkFamily::Unix | NetworkFamily::UnixDatagram)
    }

    /// 是否支持读/写方向独立关闭。
    pub const fn supports_half_close(self) -> bool {
        self.is_stream()
    }

    /// 是否支持在套接字层启用 TLS。
    pub const fn supports_tls(self) -> bool {
        matches!(self, NetworkFamily::Tcp)
    }
}

impl fmt::Display for NetworkFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl FromStr for NetworkFamily {
    type Err = SocketError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(NetworkFamily::Tcp),
            "udp" | "udp4" | "udp6" => Ok(NetworkFamily::Udp),
            "unix" => Ok(NetworkFamily::Unix),
            "unixgram" => Ok(NetworkFamily::UnixDatagram),
            _ => Err(SocketError::InvalidProtocol(value.to_owned())),
        }
    }
}

impl TryFrom<String> for NetworkFamily {
    type Error = SocketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NetworkFamily> for String {
    fn from(family: NetworkFamily) -> Self {
        family.scheme().to_owned()
    }
}

/// Unix 域套接字文件的权限位与属组。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 套接字文件即访问控制边界：错误的权限位会把本机 IPC 暴露给任意用户，因此权限与属组必须在
///   `Listen` 前校验、在绑定后核对；
/// - 属组上限沿用可移植的 `32767`，与常见 Unix 系统的 gid 范围兼容。
///
/// ## 契约（What）
/// - `mode`：权限位，取值不超过 `0o7777`；
/// - `group`：目标属组，`None` 表示沿用进程默认属组；
/// - 对 TCP/UDP 地址该结构被忽略。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnixPermissions {
    mode: u32,
    group: Option<u32>,
}

impl UnixPermissions {
    /// 默认权限位：属主与属组可读写。
    pub const DEFAULT_MODE: u32 = 0o660;
    /// 可接受的最大属组 ID。
    pub const MAX_GID: u32 = 32767;

    /// 构造并校验权限。
    pub fn new(mode: u32, group: Option<u32>) -> Result<Self, SocketError> {
        if mode > 0o7777 {
            return Err(SocketError::InvalidPermissions(format!("{mode:o}")));
        }
        if let Some(gid) = group
            && gid > Self::MAX_GID
        {
            return Err(SocketError::InvalidGroup(gid));
        }
        Ok(Self { mode, group })
    }

    /// 解析八进制权限字符串，接受 `0660`、`660`、`0o660` 三种写法。
    pub fn parse_mode(text: &str) -> Result<u32, SocketError> {
        let trimmed = text.trim();
        let digits = trimmed
            .strip_prefix("0o")
            .or_else(|| trimmed.strip_prefix("0O"))
            .unwrap_or(trimmed);
        if digits.is_empty() || digits.len() > 5 {
            return Err(SocketError::InvalidPermissions(text.to_owned()));
        }
        let mode = u32::from_str_radix(digits, 8)
            .map_err(|_| SocketError::InvalidPermissions(text.to_owned()))?;
        if mode > 0o7777 {
            return Err(SocketError::InvalidPermissions(text.to_owned()));
        }
        Ok(mode)
    }

    /// 权限位。
    pub const fn mode(&self) -> u32 {
        self.mode
    }

    /// 仅包含 rwx 的低 9 位，用于计算 umask。
    pub const fn access_bits(&self) -> u32 {
        self.mode & 0o777
    }

    /// 目标属组。
    pub const fn group(&self) -> Option<u32> {
        self.group
    }
}

impl Default for UnixPermissions {
    fn default() -> Self {
        Self {
            mode: Self::DEFAULT_MODE,
            group: None,
        }
    }
}

/// Unix `sun_path` 的可用长度（含结尾 NUL 共 108 字节）。
const MAX_UNIX_PATH: usize = 107;

/// 端点地址：网络族 + 地址字符串 + Unix 权限。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 客户端与服务端只从这一份不可变描述中推导拨号/监听参数，重新配置时整体替换，
///   不存在“改了地址却沿用旧权限”的中间态。
///
/// ## 契约（What）
/// - TCP/UDP 地址形如 `host:port`；服务端允许省略主机（`:8080` 表示监听全部地址）；
/// - Unix 地址为文件系统路径，长度不超过 107 字节；
/// - `validate_for_listen` / `validate_for_dial` 只做语法校验，不触发 DNS 解析或文件系统访问。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    family: NetworkFamily,
    address: String,
    permissions: UnixPermissions,
}

impl EndpointAddress {
    /// 以网络族与地址构造端点。
    pub fn new(family: NetworkFamily, address: impl Into<String>) -> Self {
        Self {
            family,
            address: address.into(),
            permissions: UnixPermissions::default(),
        }
    }

    /// TCP 端点。
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(NetworkFamily::Tcp, address)
    }

    /// UDP 端点。
    pub fn udp(address: impl Into<String>) -> Self {
        Self::new(NetworkFamily::Udp, address)
    }

    /// Unix 流式端点。
    pub fn unix(path: impl AsRef<Path>) -> Self {
        Self::new(NetworkFamily::Unix, path.as_ref().to_string_lossy().into_owned())
    }

    /// Unix 报文端点。
    pub fn unix_datagram(path: impl AsRef<Path>) -> Self {
        Self::new(
            NetworkFamily::UnixDatagram,
            path.as_ref().to_string_lossy().into_owned(),
        )
    }

    /// 替换 Unix 权限设置。
    pub fn with_permissions(mut self, permissions: UnixPermissions) -> Self {
        self.permissions = permissions;
        self
    }

    /// 网络族。
    pub fn family(&self) -> NetworkFamily {
        self.family
    }

    /// 原始地址字符串。
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Unix 权限设置。
    pub fn permissions(&self) -> UnixPermissions {
        self.permissions
    }

    /// Unix 族返回套接字文件路径，其它族返回 `None`。
    pub fn unix_path(&self) -> Option<&Path> {
        self.family.is_unix().then(|| Path::new(self.address.as_str()))
    }

    /// 以监听语义校验地址。
    pub fn validate_for_listen(&self) -> Result<(), SocketError> {
        self.validate(true)
    }

    /// 以拨号语义校验地址。
    pub fn validate_for_dial(&self) -> Result<(), SocketError> {
        self.validate(false)
    }

    /// 返回监听时实际使用的地址：省略主机时补全为 `0.0.0.0`。
    pub fn listen_target(&self) -> String {
        if self.family.is_unix() {
            return self.address.clone();
        }
        match self.address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.address.clone(),
        }
    }

    fn validate(&self, listening: bool) -> Result<(), SocketError> {
        if self.address.trim().is_empty() {
            return Err(self.invalid("address is empty"));
        }
        if self.family.is_unix() {
            if self.address.len() > MAX_UNIX_PATH {
                return Err(self.invalid("unix socket path is too long"));
            }
            if self.address.contains('\0') {
                return Err(self.invalid("unix socket path contains NUL"));
            }
            return Ok(());
        }

        if self.address.parse::<SocketAddr>().is_ok() {
            return Ok(());
        }
        let Some((host, port)) = self.address.rsplit_once(':') else {
            return Err(self.invalid("expected host:port"));
        };
        if port.parse::<u16>().is_err() {
            return Err(self.invalid("port is not a valid u16"));
        }
        if host.is_empty() && !listening {
            return Err(self.invalid("host is required to dial"));
        }
        if host.contains(char::is_whitespace) {
            return Err(self.invalid("host contains whitespace"));
        }
        Ok(())
    }

    fn invalid(&self, reason: &'static str) -> SocketError {
        SocketError::InvalidAddress {
            address: self.address.clone(),
            reason,
        }
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.family, self.address)
    }
}

/// 信息回调与日志使用的本地/对端地址标签。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    /// IP 地址。
    Inet(SocketAddr),
    /// Unix 域地址；未命名套接字为 `None`。
    Unix(Option<PathBuf>),
    /// 尚未建立关联时的占位。
    Unknown,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(Some(path)) => write!(f, "{}(unix)", path.display()),
            PeerAddr::Unix(None) => f.write_str("(unnamed)(unix)"),
            PeerAddr::Unknown => f.write_str("-"),
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Inet(addr)
    }
}
