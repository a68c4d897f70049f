//! Unix 域套接字文件的生命周期：清理残留、按权限创建、修正属组、退出时删除。
//!
//! # 教案级说明
//!
//! - **意图（Why）**：套接字文件就是本机 IPC 的访问控制边界，错误的权限位或属组属于安全问题，
//!   因此任何修正失败都会中止 `Listen`，而不是带着错误权限继续运行；
//! - **契约（What）**：
//!   - 绑定前删除路径上已有的非目录文件（传输层独占该路径）；
//!   - 绑定期间临时收窄进程 umask，使文件以目标权限创建；umask 在任何路径上都会恢复；
//!   - 绑定后若权限位或属组与配置不同，显式修正；
//!   - [`SocketFileGuard`] 析构时删除文件；
//! - **实现（How）**：umask 是进程级状态，所有修改都在同一把进程级锁下进行。

use std::{
    fs, io,
    os::unix::fs::{MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::{
    sys::stat::{Mode, umask},
    unistd::{Gid, chown},
};
use parking_lot::{Mutex, MutexGuard};
use spark_socket_core::{
    EndpointAddress, OperationKind, ResourceAction, Result, SocketError, UnixPermissions,
};

static UMASK_LOCK: Mutex<()> = parking_lot::const_mutex(());

/// 在作用域内收窄 umask，析构时恢复。
struct UmaskGuard {
    previous: Mode,
    _lock: MutexGuard<'static, ()>,
}

impl UmaskGuard {
    fn narrow(permissions: UnixPermissions) -> Self {
        let lock = UMASK_LOCK.lock();
        let mask = !permissions.access_bits() & 0o777;
        let previous = umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.previous);
    }
}

/// 套接字文件守卫：析构时删除文件。
#[derive(Debug)]
pub struct SocketFileGuard {
    path: PathBuf,
}

impl SocketFileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "socket file removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "failed to remove socket file"
            ),
        }
    }
}

/// 删除路径上残留的套接字文件；目录不会被删除。
pub fn remove_stale(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Err(SocketError::resource(
            path,
            ResourceAction::RemoveStale,
            io::Error::new(io::ErrorKind::AlreadyExists, "path is a directory"),
        )),
        Ok(_) => {
            tracing::debug!(path = %path.display(), "removing stale socket file");
            fs::remove_file(path)
                .or_else(|err| match err.kind() {
                    io::ErrorKind::NotFound => Ok(()),
                    _ => Err(err),
                })
                .map_err(|err| SocketError::resource(path, ResourceAction::RemoveStale, err))
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SocketError::resource(path, ResourceAction::Inspect, err)),
    }
}

/// 按端点的权限设置绑定 Unix 套接字。
///
/// `bind` 在收窄后的 umask 下执行；返回的守卫负责在释放时删除文件，
/// 因此权限修正失败时文件也会被清理。
pub fn bind_with_permissions<T, F>(
    endpoint: &EndpointAddress,
    bind: F,
) -> Result<(T, SocketFileGuard)>
where
    F: FnOnce(&Path) -> io::Result<T>,
{
    let path = endpoint.unix_path().ok_or_else(|| SocketError::InvalidAddress {
        address: endpoint.address().to_owned(),
        reason: "not a unix socket address",
    })?;
    let permissions = endpoint.permissions();

    remove_stale(path)?;

    let bound = {
        let _umask = UmaskGuard::narrow(permissions);
        bind(path).map_err(|err| SocketError::io(OperationKind::BIND, err))?
    };
    let guard = SocketFileGuard {
        path: path.to_path_buf(),
    };

    correct_permissions(path, permissions)?;
    Ok((bound, guard))
}

/// 核对并修正权限位与属组。
pub fn correct_permissions(path: &Path, permissions: UnixPermissions) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|err| SocketError::resource(path, ResourceAction::Inspect, err))?;

    let current = meta.permissions().mode() & 0o7777;
    if current != permissions.mode() {
        tracing::debug!(
            path = %path.display(),
            current = format_args!("{current:o}"),
            wanted = format_args!("{:o}", permissions.mode()),
            "correcting socket file permissions"
        );
        fs::set_permissions(path, fs::Permissions::from_mode(permissions.mode()))
            .map_err(|err| SocketError::resource(path, ResourceAction::Chmod, err))?;
    }

    if let Some(gid) = permissions.group()
        && meta.gid() != gid
    {
        tracing::debug!(path = %path.display(), gid, "correcting socket file group");
        chown(path, None, Some(Gid::from_raw(gid)))
            .map_err(|errno| SocketError::resource(path, ResourceAction::Chown, errno.into()))?;
    }
    Ok(())
}
