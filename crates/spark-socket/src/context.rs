//! 取消与截止时间上下文。
//!
//! # 教案级说明
//!
//! - **意图（Why）**：每个会阻塞的引擎操作（`listen`、`shutdown`、`connect`、`once`）以及每条连接的
//!   读写都受同一种上下文约束，取消从调用方向下级联到引擎、连接包装器、底层句柄；
//! - **契约（What）**：[`Cancellation::cancel`] 只有第一个调用者返回 `true`，且从不阻塞；
//!   子令牌在父令牌取消时一并取消，反之不成立；截止时间到达的效果等同取消，但报告为超时；
//! - **实现（How）**：原子布尔承载状态，`tokio::sync::Notify` 唤醒等待者，
//!   子令牌以 `Weak` 登记在父令牌中，父令牌取消时逐个级联。

use std::{
    future::Future,
    io,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use spark_socket_core::{OperationKind, Result, SocketError};
use tokio::{sync::Notify, time::Instant};

/// 可克隆的取消令牌。
#[derive(Clone, Debug)]
pub struct Cancellation {
    inner: Arc<CancellationState>,
}

#[derive(Debug, Default)]
struct CancellationState {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<CancellationState>>>,
}

impl Cancellation {
    /// 创建未取消的根令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancellationState::default()),
        }
    }

    /// 是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 取消令牌；只有首次成功的调用返回 `true`。
    pub fn cancel(&self) -> bool {
        cancel_state(&self.inner)
    }

    /// 派生子令牌：父令牌取消时子令牌随之取消，子令牌取消不影响父令牌。
    pub fn child(&self) -> Self {
        let child = Self::new();
        {
            let mut children = self.inner.children.lock();
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
                return child;
            }
        }
        child.cancel();
        child
    }

    /// 等待令牌被取消。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

fn cancel_state(state: &Arc<CancellationState>) -> bool {
    if state
        .flag
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return false;
    }
    state.notify.notify_waiters();
    let children = std::mem::take(&mut *state.children.lock());
    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_state(&child);
        }
    }
    true
}

/// 调用上下文：取消令牌 + 可选截止时间。
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancellation: Cancellation,
    deadline: Option<Instant>,
}

impl CallContext {
    /// 永不超时、只能显式取消的上下文。
    pub fn background() -> Self {
        Self::default()
    }

    /// 在 `timeout` 之后到期的上下文。
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// 在指定时间点到期的上下文。
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancellation: Cancellation::new(),
            deadline: Some(deadline),
        }
    }

    /// 派生子上下文，继承父上下文的截止时间。
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child(),
            deadline: self.deadline,
        }
    }

    /// 派生带更短截止时间的子上下文。
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        Self {
            cancellation: self.cancellation.child(),
            deadline: Some(self.deadline.map_or(candidate, |own| own.min(candidate))),
        }
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 取消上下文。
    pub fn cancel(&self) -> bool {
        self.cancellation.cancel()
    }

    /// 截止时间是否已过。
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= Instant::now())
    }

    /// 已取消或已过期。
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled() || self.is_expired()
    }

    /// 未完成时返回 `Ok(())`，否则返回对应的取消/超时错误。
    pub fn check(&self, op: OperationKind) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(SocketError::Cancelled { op });
        }
        if self.is_expired() {
            return Err(SocketError::Timeout { op });
        }
        Ok(())
    }

    /// 等待取消或到期，返回对应错误。
    pub async fn done(&self, op: OperationKind) -> SocketError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => SocketError::Cancelled { op },
                _ = tokio::time::sleep_until(deadline) => SocketError::Timeout { op },
            },
            None => {
                self.cancellation.cancelled().await;
                SocketError::Cancelled { op }
            }
        }
    }
}

/// 在保留取消/超时语义的前提下执行 IO Future。
pub(crate) async fn run_with_context<F, T>(
    ctx: &CallContext,
    op: OperationKind,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    ctx.check(op)?;
    tokio::select! {
        biased;
        err = ctx.done(op) => Err(err),
        result = future => result.map_err(|err| SocketError::io(op, err)),
    }
}

/// 与 [`run_with_context`] 相同，但只受取消令牌约束。
pub(crate) async fn run_cancellable<F, T>(
    cancellation: &Cancellation,
    op: OperationKind,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if cancellation.is_cancelled() {
        return Err(SocketError::Cancelled { op });
    }
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(SocketError::Cancelled { op }),
        result = future => result.map_err(|err| SocketError::io(op, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_reports_first_caller_only() {
        let token = Cancellation::new();
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[test]
    fn child_follows_parent_but_not_reverse() {
        let parent = Cancellation::new();
        let child = parent.child();
        assert!(child.cancel());
        assert!(!parent.is_cancelled());

        let second = parent.child();
        parent.cancel();
        assert!(second.is_cancelled());

        let late = parent.child();
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = Cancellation::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_reported_as_timeout() {
        let ctx = CallContext::with_timeout(Duration::from_millis(50));
        let result = run_with_context(&ctx, OperationKind::CONNECT, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, io::Error>(())
        })
        .await;
        assert!(matches!(result, Err(SocketError::Timeout { .. })));
        assert!(ctx.is_done());
        assert!(!ctx.cancellation().is_cancelled());
    }
}
