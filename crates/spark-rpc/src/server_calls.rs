//! # server_calls：服务端四类调用适配器
//!
//! ## 角色定位（Why）
//! 传输层以推送回调交付请求、接收响应；Handler 面向结果值与异步序列编写。
//! 本模块在两者之间做双向桥接，每类调用形态一个适配器：
//!
//! | 适配器 | 入站 | 出站 |
//! |---|---|---|
//! | [`one_to_one`] | 单个值 | 结果值 |
//! | [`one_to_many`] | 单个值 | 异步序列 |
//! | [`many_to_one`] | 入站泵 | 结果值 |
//! | [`many_to_many`] | 入站泵 | 异步序列 |
//!
//! ## 行为契约（What）
//! - Handler 同步失败（返回 `Err` 或在调用当下 panic）时，恰好推送一个错误，
//!   不推送条目，也不遗留任何会话登记；
//! - 出站为序列的调用在订阅前登记出站会话；入站为序列的调用在创建入站泵时登记；
//!   每个会话在自身的终止事件上独立撤销；
//! - 订阅即把驱动任务交给 [`CallExecutor`]，适配器随即返回；
//! - Handler 在被轮询期间 panic，同样以 `INTERNAL` 终止调用。
//!
//! ## 取消（How）
//! 对端取消经由 [`CallHandle::cancel`]：中止驱动任务、把响应汇标记为已取消（不再推送）、
//! 以 `CANCELLED` 关闭入站泵，并撤销该调用名下的所有会话。

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::{AbortHandle, AbortRegistration, Abortable};
use futures::{FutureExt, StreamExt};
use tracing::warn;

use crate::observer::{ResponseSink, SinkControl, StreamObserver};
use crate::runtime::CallExecutor;
use crate::status::{BoxError, Status, to_status_failure};
use crate::tracker::{Direction, Session, SessionId, SessionTracker, Terminate};
use crate::value::{RequestPump, Streaming, UnaryFuture, ValueStream, request_pump};

/// 适配器运行所需的调用级环境。
#[derive(Clone)]
pub struct CallScope {
    method: Arc<str>,
    executor: Arc<dyn CallExecutor>,
    tracker: Arc<dyn SessionTracker>,
}

impl CallScope {
    pub fn new(
        method: Arc<str>,
        executor: Arc<dyn CallExecutor>,
        tracker: Arc<dyn SessionTracker>,
    ) -> Self {
        Self {
            method,
            executor,
            tracker,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn spawn<F>(&self, driver: F, registration: AbortRegistration)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.executor
            .spawn(Abortable::new(driver, registration).map(|_| ()).boxed());
    }

    fn track(&self, direction: Direction, handle: Arc<dyn Terminate>) -> SessionId {
        let session = Session::new(Arc::clone(&self.method), direction, handle);
        let id = session.id();
        self.tracker.track(session);
        id
    }
}

impl fmt::Debug for CallScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallScope")
            .field("method", &self.method)
            .field("tracking", &self.tracker.is_enabled())
            .finish()
    }
}

/// 已受理调用的控制句柄，交还给传输层。
pub struct CallHandle<Req> {
    abort: Option<AbortHandle>,
    sink: Arc<dyn SinkControl>,
    pump: Option<Arc<RequestPump<Req>>>,
    sessions: Vec<SessionId>,
    tracker: Arc<dyn SessionTracker>,
}

impl<Req: Send + 'static> CallHandle<Req> {
    /// 对端取消。调用已终止时没有可观察的效果。
    pub fn cancel(&self) {
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        self.sink.abandon();
        if let Some(pump) = &self.pump {
            pump.fail(Status::cancelled("call cancelled by peer"));
        }
        for id in &self.sessions {
            self.tracker.untrack(*id);
        }
    }
}

impl<Req> fmt::Debug for CallHandle<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandle")
            .field("sessions", &self.sessions)
            .field("streaming_inbound", &self.pump.is_some())
            .finish()
    }
}

/// 出站会话的强制终止：停止生产，再以完成关闭响应汇。
struct OutboundTerminator {
    abort: AbortHandle,
    sink: Arc<dyn SinkControl>,
}

impl Terminate for OutboundTerminator {
    fn terminate(&self) {
        self.abort.abort();
        self.sink.complete();
    }
}

/// 入站会话的强制终止：以完成关闭入站泵。
struct InboundTerminator<Req> {
    pump: Arc<RequestPump<Req>>,
}

impl<Req: Send + 'static> Terminate for InboundTerminator<Req> {
    fn terminate(&self) {
        self.pump.close();
    }
}

/// one→one。
pub fn one_to_one<Req, Resp, F>(
    request: Req,
    sink: Arc<ResponseSink<Resp>>,
    invoke: F,
    scope: &CallScope,
) -> CallHandle<Req>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: FnOnce(Req) -> Result<UnaryFuture<Resp>, BoxError>,
{
    let future = match invoke_guarded(scope.method(), move || invoke(request)) {
        Ok(future) => future,
        Err(status) => {
            sink.error(status);
            return CallHandle::settled(sink, None, scope);
        }
    };

    let (abort, registration) = AbortHandle::new_pair();
    let driver = {
        let sink = Arc::clone(&sink);
        let method = Arc::clone(&scope.method);
        async move { resolve_unary(future, &sink, &method).await }
    };
    scope.spawn(driver, registration);

    CallHandle {
        abort: Some(abort),
        sink,
        pump: None,
        sessions: Vec::new(),
        tracker: Arc::clone(&scope.tracker),
    }
}

/// one→many。
pub fn one_to_many<Req, Resp, F>(
    request: Req,
    sink: Arc<ResponseSink<Resp>>,
    invoke: F,
    scope: &CallScope,
) -> CallHandle<Req>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: FnOnce(Req) -> Result<ValueStream<Resp>, BoxError>,
{
    let stream = match invoke_guarded(scope.method(), move || invoke(request)) {
        Ok(stream) => stream,
        Err(status) => {
            sink.error(status);
            return CallHandle::settled(sink, None, scope);
        }
    };

    let (abort, registration) = AbortHandle::new_pair();
    let outbound = scope.track(
        Direction::Outbound,
        Arc::new(OutboundTerminator {
            abort: abort.clone(),
            sink: Arc::clone(&sink) as Arc<dyn SinkControl>,
        }),
    );
    scope.spawn(
        drive_sequence(stream, Arc::clone(&sink), scope, outbound),
        registration,
    );

    CallHandle {
        abort: Some(abort),
        sink,
        pump: None,
        sessions: vec![outbound],
        tracker: Arc::clone(&scope.tracker),
    }
}

/// many→one。
///
/// 出站会话在入站泵创建时即登记；Handler 同步失败时在返回前撤销。
/// 返回值中的观察者即入站泵，交给传输层推送请求。
pub fn many_to_one<Req, Resp, F>(
    sink: Arc<ResponseSink<Resp>>,
    invoke: F,
    scope: &CallScope,
) -> (CallHandle<Req>, Arc<dyn StreamObserver<Req>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: FnOnce(Streaming<Req>) -> Result<UnaryFuture<Resp>, BoxError>,
{
    let (pump, requests) = request_pump::<Req>();
    let (abort, registration) = AbortHandle::new_pair();
    let outbound = scope.track(
        Direction::Outbound,
        Arc::new(OutboundTerminator {
            abort: abort.clone(),
            sink: Arc::clone(&sink) as Arc<dyn SinkControl>,
        }),
    );

    let future = match invoke_guarded(scope.method(), move || invoke(requests)) {
        Ok(future) => future,
        Err(status) => {
            scope.tracker.untrack(outbound);
            sink.error(status);
            pump.close();
            let requests = Arc::clone(&pump) as Arc<dyn StreamObserver<Req>>;
            return (CallHandle::settled(sink, Some(pump), scope), requests);
        }
    };

    let driver = {
        let sink = Arc::clone(&sink);
        let method = Arc::clone(&scope.method);
        let tracker = Arc::clone(&scope.tracker);
        async move {
            resolve_unary(future, &sink, &method).await;
            tracker.untrack(outbound);
        }
    };
    scope.spawn(driver, registration);

    let requests = Arc::clone(&pump) as Arc<dyn StreamObserver<Req>>;
    let handle = CallHandle {
        abort: Some(abort),
        sink,
        pump: Some(pump),
        sessions: vec![outbound],
        tracker: Arc::clone(&scope.tracker),
    };
    (handle, requests)
}

/// many→many。
///
/// 入站泵与出站序列各自登记为独立会话，各自在终止时撤销。
pub fn many_to_many<Req, Resp, F>(
    sink: Arc<ResponseSink<Resp>>,
    invoke: F,
    scope: &CallScope,
) -> (CallHandle<Req>, Arc<dyn StreamObserver<Req>>)
where
    Req: Send + 'static,
    Resp: Send + 'static,
    F: FnOnce(Streaming<Req>) -> Result<ValueStream<Resp>, BoxError>,
{
    let (pump, requests) = request_pump::<Req>();
    let inbound = scope.track(
        Direction::Inbound,
        Arc::new(InboundTerminator {
            pump: Arc::clone(&pump),
        }),
    );
    {
        let tracker = Arc::clone(&scope.tracker);
        pump.set_terminal_hook(move || {
            tracker.untrack(inbound);
        });
    }

    let stream = match invoke_guarded(scope.method(), move || invoke(requests)) {
        Ok(stream) => stream,
        Err(status) => {
            sink.error(status);
            pump.close();
            let requests = Arc::clone(&pump) as Arc<dyn StreamObserver<Req>>;
            return (CallHandle::settled(sink, Some(pump), scope), requests);
        }
    };

    let (abort, registration) = AbortHandle::new_pair();
    let outbound = scope.track(
        Direction::Outbound,
        Arc::new(OutboundTerminator {
            abort: abort.clone(),
            sink: Arc::clone(&sink) as Arc<dyn SinkControl>,
        }),
    );
    scope.spawn(
        drive_sequence(stream, Arc::clone(&sink), scope, outbound),
        registration,
    );

    let requests = Arc::clone(&pump) as Arc<dyn StreamObserver<Req>>;
    let handle = CallHandle {
        abort: Some(abort),
        sink,
        pump: Some(pump),
        sessions: vec![inbound, outbound],
        tracker: Arc::clone(&scope.tracker),
    };
    (handle, requests)
}

impl<Req> CallHandle<Req> {
    /// 同步失败后的句柄：没有驱动任务，也没有登记中的会话。
    fn settled<Resp: Send + 'static>(
        sink: Arc<ResponseSink<Resp>>,
        pump: Option<Arc<RequestPump<Req>>>,
        scope: &CallScope,
    ) -> Self {
        Self {
            abort: None,
            sink: sink as Arc<dyn SinkControl>,
            pump,
            sessions: Vec::new(),
            tracker: Arc::clone(&scope.tracker),
        }
    }
}

/// 在调用当下执行 Handler，把 `Err` 与 panic 统一转换为 [`Status`]。
fn invoke_guarded<T>(
    method: &str,
    invoke: impl FnOnce() -> Result<T, BoxError>,
) -> Result<T, Status> {
    match panic::catch_unwind(AssertUnwindSafe(invoke)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(to_status_failure(error)),
        Err(payload) => Err(panic_status(method, payload.as_ref())),
    }
}

async fn resolve_unary<Resp: Send + 'static>(
    future: UnaryFuture<Resp>,
    sink: &ResponseSink<Resp>,
    method: &str,
) {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => {
            if sink.next(value) {
                sink.complete();
            }
        }
        Ok(Err(error)) => {
            sink.error(to_status_failure(error));
        }
        Err(payload) => {
            sink.error(panic_status(method, payload.as_ref()));
        }
    }
}

fn drive_sequence<Resp: Send + 'static>(
    stream: ValueStream<Resp>,
    sink: Arc<ResponseSink<Resp>>,
    scope: &CallScope,
    session: SessionId,
) -> impl Future<Output = ()> + Send + 'static {
    let method = Arc::clone(&scope.method);
    let tracker = Arc::clone(&scope.tracker);
    async move {
        let outcome = AssertUnwindSafe(forward_sequence(stream, &sink))
            .catch_unwind()
            .await;
        if let Err(payload) = outcome {
            sink.error(panic_status(&method, payload.as_ref()));
        }
        tracker.untrack(session);
    }
}

async fn forward_sequence<Resp: Send + 'static>(
    mut stream: ValueStream<Resp>,
    sink: &ResponseSink<Resp>,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(value) => {
                if !sink.next(value) {
                    return;
                }
            }
            Err(error) => {
                sink.error(to_status_failure(error));
                return;
            }
        }
    }
    sink.complete();
}

fn panic_status(method: &str, payload: &(dyn Any + Send)) -> Status {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_owned());
    warn!(method, panic = %detail, "handler panicked");
    Status::internal(detail)
}
