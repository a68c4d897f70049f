use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::Poll,
};

use futures_util::{future::poll_fn, task::AtomicWaker};
use tokio::task::JoinHandle;

/// 服务端的结构化并发监督者：统计在途的连接任务与 Handler 任务。
///
/// # 教案级注释
/// - **意图 (Why)**：停机时确定性地等待所有连接任务退出，而不是用宽限期“猜测”它们大概结束了；
/// - **设计与逻辑 (How)**：
///   - 以原子计数跟踪在途任务，使用 [`AtomicWaker`] 在计数归零时唤醒等待者；
///   - `spawn` 在任务提交前生成守卫，任务完成、被取消或 panic 时守卫析构都会递减计数；
/// - **契约 (What)**：
///   - 只有一个等待者（服务端的 `listen` 主循环）调用 [`wait_for_idle`](Self::wait_for_idle)；
///   - 返回时计数必为 0。
#[derive(Clone, Default)]
pub struct TaskTracker {
    inner: Arc<TaskTrackerInner>,
}

#[derive(Default)]
struct TaskTrackerInner {
    counter: AtomicUsize,
    waker: AtomicWaker,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在当前运行时上派生一个被跟踪的任务。
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = TaskGuard::new(self.clone());
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// 当前在途任务数量。
    pub fn in_flight(&self) -> usize {
        self.inner.counter.load(Ordering::Acquire)
    }

    /// 等待所有被跟踪任务完成。
    pub async fn wait_for_idle(&self) {
        poll_fn(|cx| {
            if self.in_flight() == 0 {
                return Poll::Ready(());
            }
            self.inner.waker.register(cx.waker());
            if self.in_flight() == 0 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

struct TaskGuard {
    tracker: TaskTracker,
}

impl TaskGuard {
    fn new(tracker: TaskTracker) -> Self {
        tracker.inner.counter.fetch_add(1, Ordering::Release);
        Self { tracker }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.tracker.inner.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.inner.waker.wake();
        }
    }
}
