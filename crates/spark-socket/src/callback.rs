use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use spark_socket_core::{ConnState, PeerAddr, SocketError};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
};

type ErrorFn = Box<dyn Fn(&[SocketError]) + Send + Sync>;
type InfoFn = Box<dyn Fn(&PeerAddr, &PeerAddr, ConnState) + Send + Sync>;
type ServerInfoFn = Box<dyn Fn(&str) + Send + Sync>;

/// 回调队列的默认容量。
pub const DEFAULT_CALLBACK_QUEUE: usize = 1024;

enum Event {
    Errors(Vec<SocketError>),
    Info {
        local: PeerAddr,
        remote: PeerAddr,
        state: ConnState,
    },
    ServerInfo(String),
}

impl Event {
    fn kind(&self) -> &'static str {
        match self {
            Event::Errors(_) => "error",
            Event::Info { .. } => "info",
            Event::ServerInfo(_) => "server_info",
        }
    }
}

#[derive(Default)]
struct Slots {
    error: ArcSwapOption<ErrorFn>,
    info: ArcSwapOption<InfoFn>,
    server_info: ArcSwapOption<ServerInfoFn>,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

impl Slots {
    fn deliver(&self, event: Event) {
        let kind = event.kind();
        let outcome = match event {
            Event::Errors(errors) => match self.error.load_full() {
                Some(callback) => catch_unwind(AssertUnwindSafe(|| callback(&errors))),
                None => Ok(()),
            },
            Event::Info {
                local,
                remote,
                state,
            } => match self.info.load_full() {
                Some(callback) => {
                    catch_unwind(AssertUnwindSafe(|| callback(&local, &remote, state)))
                }
                None => Ok(()),
            },
            Event::ServerInfo(message) => match self.server_info.load_full() {
                Some(callback) => catch_unwind(AssertUnwindSafe(|| callback(&message))),
                None => Ok(()),
            },
        };
        if let Err(payload) = outcome {
            self.panicked.fetch_add(1, Ordering::Relaxed);
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            tracing::error!(callback = kind, panic = %reason, "socket callback panicked");
        }
    }
}

/// 错误/信息回调注册表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 回调只是额外的异步通知通道，绝不能阻塞 IO 热路径，也不能因为用户代码 panic 而中断连接；
/// - 每个注册表只有一个有界队列和一个消费任务，积压上限显式可控，不会为每次回调各派生一个任务。
///
/// ## 契约（What）
/// - 三个槽位（错误、信息、服务端信息）各自独立，注册即原子替换，`clear_*` 取消注册；
/// - 投递非阻塞：队列满或当前线程不在 Tokio 运行时内时丢弃事件并计入 [`dropped_events`](Self::dropped_events)；
/// - 每次回调都在独立的 `catch_unwind` 边界内执行，panic 只记录日志并计入
///   [`panicked_callbacks`](Self::panicked_callbacks)。
///
/// ## 实现（How）
/// - 槽位使用 `ArcSwapOption`，投递前读取一次以跳过未注册的槽位；
/// - 消费任务在首次投递时于当前运行时中惰性启动；若其所在运行时已经关闭，下次投递会重建队列。
pub struct CallbackRegistry {
    slots: Arc<Slots>,
    queue: Mutex<Option<mpsc::Sender<Event>>>,
    capacity: usize,
}

impl CallbackRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            queue: Mutex::new(None),
            capacity: capacity.max(1),
        }
    }

    /// 注册错误回调，替换已有回调。
    pub fn set_error<F>(&self, callback: F)
    where
        F: Fn(&[SocketError]) + Send + Sync + 'static,
    {
        self.slots.error.store(Some(Arc::new(Box::new(callback))));
    }

    pub fn clear_error(&self) {
        self.slots.error.store(None);
    }

    /// 注册信息回调，参数依次为本地地址、对端地址与连接状态。
    pub fn set_info<F>(&self, callback: F)
    where
        F: Fn(&PeerAddr, &PeerAddr, ConnState) + Send + Sync + 'static,
    {
        self.slots.info.store(Some(Arc::new(Box::new(callback))));
    }

    pub fn clear_info(&self) {
        self.slots.info.store(None);
    }

    /// 注册服务端信息回调，用于生命周期文案（监听、排空、停止）。
    pub fn set_server_info<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.slots.server_info.store(Some(Arc::new(Box::new(callback))));
    }

    pub fn clear_server_info(&self) {
        self.slots.server_info.store(None);
    }

    pub fn has_error_callback(&self) -> bool {
        self.slots.error.load().is_some()
    }

    /// 投递错误；空列表被忽略。
    pub fn errors(&self, errors: Vec<SocketError>) {
        if errors.is_empty() || !self.has_error_callback() {
            return;
        }
        self.dispatch(Event::Errors(errors));
    }

    /// 投递单个错误。
    pub fn error(&self, error: &SocketError) {
        if self.has_error_callback() {
            self.dispatch(Event::Errors(vec![error.clone()]));
        }
    }

    pub fn info(&self, local: &PeerAddr, remote: &PeerAddr, state: ConnState) {
        if self.slots.info.load().is_none() {
            return;
        }
        self.dispatch(Event::Info {
            local: local.clone(),
            remote: remote.clone(),
            state,
        });
    }

    pub fn server_info(&self, message: impl Into<String>) {
        if self.slots.server_info.load().is_none() {
            return;
        }
        self.dispatch(Event::ServerInfo(message.into()));
    }

    /// 因队列已满或缺少运行时而丢弃的事件数。
    pub fn dropped_events(&self) -> u64 {
        self.slots.dropped.load(Ordering::Relaxed)
    }

    /// 发生 panic 的回调次数。
    pub fn panicked_callbacks(&self) -> u64 {
        self.slots.panicked.load(Ordering::Relaxed)
    }

    fn dispatch(&self, event: Event) {
        let mut queue = self.queue.lock();
        let mut event = event;
        for _ in 0..2 {
            let sender = match queue.as_ref() {
                Some(sender) => sender.clone(),
                None => match self.spawn_worker() {
                    Some(sender) => {
                        *queue = Some(sender.clone());
                        sender
                    }
                    None => {
                        self.drop_event(&event, "no tokio runtime");
                        return;
                    }
                },
            };
            match sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    self.drop_event(&rejected, "callback queue is full");
                    return;
                }
                Err(TrySendError::Closed(rejected)) => {
                    *queue = None;
                    event = rejected;
                }
            }
        }
        self.drop_event(&event, "callback worker unavailable");
    }

    fn spawn_worker(&self) -> Option<mpsc::Sender<Event>> {
        let handle = Handle::try_current().ok()?;
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let slots = Arc::clone(&self.slots);
        handle.spawn(async move {
            while let Some(event) = rx.recv().await {
                slots.deliver(event);
            }
        });
        Some(tx)
    }

    fn drop_event(&self, event: &Event, reason: &'static str) {
        self.slots.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(callback = event.kind(), reason, "socket callback event dropped");
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CALLBACK_QUEUE)
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("capacity", &self.capacity)
            .field("error", &self.slots.error.load().is_some())
            .field("info", &self.slots.info.load().is_some())
            .field("server_info", &self.slots.server_info.load().is_some())
            .field("dropped", &self.dropped_events())
            .field("panicked", &self.panicked_callbacks())
            .finish()
    }
}
