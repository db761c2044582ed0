//! # observer：传输层推送通道与受保护的响应汇
//!
//! ## 角色定位（Why）
//! - 传输层以“观察者回调”形式推送事件（`on_next` / `on_error` / `on_completed`），
//!   [`StreamObserver`] 把这组回调抽象为一个三方法 trait，入站与出站方向共用；
//! - 传输层对同一调用的重复终止信号没有防护，[`ResponseSink`] 在出站方向包一层状态机，
//!   保证“至多一次终止、终止后不再推送条目”。
//!
//! ## 并发约束（What）
//! - 回调可能来自任意线程；`ResponseSink` 在持有内部互斥锁期间转发事件，
//!   因此同一调用上的推送互不交错，且不会在终止信号之后再出现条目；
//! - 下游观察者不得在回调内部重入同一个 `ResponseSink`。

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::status::Status;

/// 推送式观察者：生产者经由它向消费者投递条目与终止信号。
pub trait StreamObserver<T>: Send + Sync {
    /// 投递一个条目。
    fn on_next(&self, item: T);

    /// 以错误终止。
    fn on_error(&self, status: Status);

    /// 正常终止。
    fn on_completed(&self);
}

/// 调用的生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallState {
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallState::Active)
    }
}

/// 出站方向的终止结果，供拦截器的响应阶段观察。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallOutcome {
    Completed,
    Failed(Status),
    /// 对端取消，传输层不会再收到任何信号。
    Cancelled,
}

impl CallOutcome {
    fn state(&self) -> CallState {
        match self {
            CallOutcome::Completed => CallState::Completed,
            CallOutcome::Failed(_) => CallState::Failed,
            CallOutcome::Cancelled => CallState::Cancelled,
        }
    }
}

type TerminalHook = Box<dyn FnOnce(&CallOutcome) + Send>;

/// 单个调用独占的出站响应汇。
///
/// # 契约说明（What）
/// - 状态从 [`CallState::Active`] 出发，只能迁移一次到某个终止态；
/// - [`next`](Self::next) 在终止后返回 `false` 并丢弃条目；
/// - [`error`](Self::error) / [`complete`](Self::complete) / [`abandon`](Self::abandon)
///   只有第一次生效，之后的调用没有可观察的副作用，返回 `false`；
/// - 可选的终止钩子在首次终止后恰好执行一次（拦截器的响应阶段即挂在这里）。
pub struct ResponseSink<T> {
    downstream: Arc<dyn StreamObserver<T>>,
    state: Mutex<CallState>,
    on_terminal: Mutex<Option<TerminalHook>>,
}

impl<T: Send + 'static> ResponseSink<T> {
    /// 包装传输层提供的出站观察者。
    pub fn new(downstream: Arc<dyn StreamObserver<T>>) -> Arc<Self> {
        Arc::new(Self {
            downstream,
            state: Mutex::new(CallState::Active),
            on_terminal: Mutex::new(None),
        })
    }

    /// 包装出站观察者，并在首次终止后执行 `hook`。
    pub fn with_terminal_hook<H>(downstream: Arc<dyn StreamObserver<T>>, hook: H) -> Arc<Self>
    where
        H: FnOnce(&CallOutcome) + Send + 'static,
    {
        Arc::new(Self {
            downstream,
            state: Mutex::new(CallState::Active),
            on_terminal: Mutex::new(Some(Box::new(hook))),
        })
    }

    pub fn state(&self) -> CallState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().is_terminal()
    }

    /// 推送一个条目；调用已终止时返回 `false`，生产方据此停止生产。
    pub fn next(&self, item: T) -> bool {
        let state = self.state.lock();
        if state.is_terminal() {
            debug!(state = ?*state, "discarding item pushed after terminal signal");
            return false;
        }
        self.downstream.on_next(item);
        true
    }

    /// 以错误终止调用。
    pub fn error(&self, status: Status) -> bool {
        self.finish(CallOutcome::Failed(status))
    }

    /// 正常终止调用。
    pub fn complete(&self) -> bool {
        self.finish(CallOutcome::Completed)
    }

    /// 标记为对端取消：不向传输层推送任何信号。
    pub fn abandon(&self) -> bool {
        self.finish(CallOutcome::Cancelled)
    }

    fn finish(&self, outcome: CallOutcome) -> bool {
        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                debug!(state = ?*state, late = ?outcome, "discarding late terminal signal");
                return false;
            }
            *state = outcome.state();
            match &outcome {
                CallOutcome::Completed => self.downstream.on_completed(),
                CallOutcome::Failed(status) => self.downstream.on_error(status.clone()),
                CallOutcome::Cancelled => {}
            }
        }
        let hook = self.on_terminal.lock().take();
        if let Some(hook) = hook {
            hook(&outcome);
        }
        true
    }
}

impl<T: Send + 'static> StreamObserver<T> for ResponseSink<T> {
    fn on_next(&self, item: T) {
        self.next(item);
    }

    fn on_error(&self, status: Status) {
        self.error(status);
    }

    fn on_completed(&self) {
        self.complete();
    }
}

impl<T> fmt::Debug for ResponseSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// 类型擦除后的终止控制，供会话追踪与取消路径使用。
pub(crate) trait SinkControl: Send + Sync {
    fn complete(&self) -> bool;
    fn abandon(&self) -> bool;
}

impl<T: Send + 'static> SinkControl for ResponseSink<T> {
    fn complete(&self) -> bool {
        ResponseSink::complete(self)
    }

    fn abandon(&self) -> bool {
        ResponseSink::abandon(self)
    }
}
