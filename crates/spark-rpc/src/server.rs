//! # server：路由表热替换、调用受理与关停
//!
//! ## 设计目的（Why）
//! - 路由表以 [`ArcSwapOption`] 发布：纯查询走无锁读取，替换对读者原子生效；
//! - 全局替换锁（`parking_lot::RwLock<()>`）把“排空旧会话 + 发布新表”串成一个临界区：
//!   写端由 [`RpcServer::publish`] / [`RpcServer::shutdown`] 持有，读端在受理调用、
//!   解析 Handler 并启动适配器期间持有，因此新调用只会在替换期间短暂等待，
//!   且永远看不到半更新的表；并发的替换按到达顺序排队，不会丢失。
//!
//! ## 契约说明（What）
//! - `publish`：若已有快照，先排空会话登记簿（强制终止所有登记中的流式会话），再存入新快照；
//! - `shutdown`：排空后拒绝一切新调用（`UNAVAILABLE`）与新快照（[`RpcError::ShutDown`]）；
//! - `start_call`：调用在受理时解析 Handler 并持有其克隆，之后的替换不影响该调用；
//! - 受理前的失败（未知方法、拦截器拒绝、服务器已关停）以 `Err(Status)` 返回，
//!   由传输层负责把该状态交给对端。
//!
//! ## 单值入站（How）
//! 传输层总以推送方式交付请求；对单值入站的方法，[`ServerCall::request_observer`]
//! 收集恰好一个请求，在半关闭时才启动适配器：
//! - 半关闭时没有请求：`INTERNAL "half-closed without a request"`；
//! - 收到第二个请求：`INTERNAL "too many requests"`。

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::context::{CallContext, Metadata};
use crate::error::RpcError;
use crate::observer::{ResponseSink, StreamObserver};
use crate::routing::RoutingTable;
use crate::runtime::CallExecutor;
use crate::server_calls::{self, CallHandle, CallScope};
use crate::service::{MethodHandler, MethodKind};
use crate::status::Status;
use crate::tracker::SessionTracker;

/// 一次发布的结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwapReport {
    pub revision: u64,
    /// 发布前被强制终止的会话数量。
    pub drained: usize,
}

/// 进程内的 RPC 服务器状态：当前路由表、替换锁与会话登记簿。
pub struct RpcServer<M> {
    published: ArcSwapOption<RoutingTable<M>>,
    swap_lock: RwLock<()>,
    closed: AtomicBool,
    tracker: Arc<dyn SessionTracker>,
    executor: Arc<dyn CallExecutor>,
}

impl<M: Send + 'static> RpcServer<M> {
    pub fn new(executor: Arc<dyn CallExecutor>, tracker: Arc<dyn SessionTracker>) -> Self {
        Self {
            published: ArcSwapOption::empty(),
            swap_lock: RwLock::new(()),
            closed: AtomicBool::new(false),
            tracker,
            executor,
        }
    }

    /// 按配置选择会话登记簿。
    pub fn with_config(config: &RpcConfig, executor: Arc<dyn CallExecutor>) -> Self {
        Self::new(executor, config.tracker())
    }

    /// 从 TOML 配置文本构建；解析或校验失败时返回 [`RpcError::Config`]。
    pub fn from_toml(source: &str, executor: Arc<dyn CallExecutor>) -> Result<Self, RpcError> {
        let config = RpcConfig::from_toml_str(source)?;
        Ok(Self::with_config(&config, executor))
    }

    pub fn tracker(&self) -> &Arc<dyn SessionTracker> {
        &self.tracker
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 当前快照；尚未发布或已关停时为 `None`。
    pub fn current(&self) -> Option<Arc<RoutingTable<M>>> {
        self.published.load_full()
    }

    /// 无锁查询方法形态。
    pub fn lookup(&self, method: &str) -> Option<MethodKind> {
        let current = self.published.load();
        match &*current {
            Some(table) => table.resolve(method).map(MethodHandler::kind),
            None => None,
        }
    }

    /// 发布新快照，必要时先排空旧会话。
    pub fn publish(&self, table: RoutingTable<M>) -> Result<SwapReport, RpcError> {
        let _swap = self.swap_lock.write();
        if self.is_shut_down() {
            return Err(RpcError::ShutDown);
        }

        let drained = if self.published.load().is_some() {
            self.tracker.drain()
        } else {
            0
        };
        let revision = table.revision();
        let services = table.services().count();
        let methods = table.methods().len();
        self.published.store(Some(Arc::new(table)));

        info!(revision, drained, services, methods, "routing table published");
        Ok(SwapReport { revision, drained })
    }

    /// 关停：排空后拒绝新调用。返回被强制终止的会话数量，重复调用返回 0。
    pub fn shutdown(&self) -> usize {
        let _swap = self.swap_lock.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let drained = self.tracker.drain();
        self.published.store(None);
        info!(drained, "rpc server shut down");
        drained
    }

    /// 受理一个调用。
    ///
    /// `response_observer` 为传输层的出站推送通道；返回的 [`ServerCall`] 提供入站推送通道
    /// 与对端取消入口。
    pub fn start_call(
        &self,
        method: &str,
        metadata: Metadata,
        response_observer: Arc<dyn StreamObserver<M>>,
    ) -> Result<ServerCall<M>, Status> {
        let _accepting = self.swap_lock.read();
        if self.is_shut_down() {
            return Err(Status::unavailable("server is shutting down"));
        }
        let table = self
            .published
            .load_full()
            .ok_or_else(|| Status::unavailable("no routing table published"))?;
        let handler = table
            .resolve(method)
            .cloned()
            .ok_or_else(|| Status::unimplemented(format!("method not found: {method}")))?;

        let method: Arc<str> = Arc::from(method);
        let kind = handler.kind();
        let mut ctx = CallContext::new(Arc::clone(&method), kind, metadata);
        let chain = table.interceptors().clone();
        chain.enter(&mut ctx)?;

        debug!(method = ctx.method(), ?kind, "call accepted");
        let sink = ResponseSink::with_terminal_hook(response_observer, move |outcome| {
            chain.close(&ctx, outcome)
        });
        let scope = CallScope::new(
            Arc::clone(&method),
            Arc::clone(&self.executor),
            Arc::clone(&self.tracker),
        );

        let (control, requests) = match handler {
            MethodHandler::ClientStreaming(handler) => {
                let (handle, requests) =
                    server_calls::many_to_one(sink, move |input| handler(input), &scope);
                (CallControl::Started(handle), requests)
            }
            MethodHandler::BidiStreaming(handler) => {
                let (handle, requests) =
                    server_calls::many_to_many(sink, move |input| handler(input), &scope);
                (CallControl::Started(handle), requests)
            }
            MethodHandler::Unary(handler) => {
                let start_sink = Arc::clone(&sink);
                let start: StartFn<M> = Box::new(move |request| {
                    server_calls::one_to_one(request, start_sink, move |r| handler(r), &scope)
                });
                let collector = SingleRequest::new(sink, start);
                (
                    CallControl::Collecting(Arc::clone(&collector)),
                    collector as Arc<dyn StreamObserver<M>>,
                )
            }
            MethodHandler::ServerStreaming(handler) => {
                let start_sink = Arc::clone(&sink);
                let start: StartFn<M> = Box::new(move |request| {
                    server_calls::one_to_many(request, start_sink, move |r| handler(r), &scope)
                });
                let collector = SingleRequest::new(sink, start);
                (
                    CallControl::Collecting(Arc::clone(&collector)),
                    collector as Arc<dyn StreamObserver<M>>,
                )
            }
        };

        Ok(ServerCall {
            method,
            kind,
            requests,
            control,
        })
    }
}

impl<M> fmt::Debug for RpcServer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field(
                "revision",
                &self.published.load_full().map(|table| table.revision()),
            )
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("sessions", &self.tracker.len())
            .finish()
    }
}

/// 已受理的调用，交给传输层持有。
pub struct ServerCall<M> {
    method: Arc<str>,
    kind: MethodKind,
    requests: Arc<dyn StreamObserver<M>>,
    control: CallControl<M>,
}

enum CallControl<M> {
    Started(CallHandle<M>),
    Collecting(Arc<SingleRequest<M>>),
}

impl<M: Send + 'static> ServerCall<M> {
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    /// 入站推送通道：传输层把请求、请求错误与半关闭推送到这里。
    pub fn request_observer(&self) -> Arc<dyn StreamObserver<M>> {
        Arc::clone(&self.requests)
    }

    /// 对端取消；调用已终止时没有可观察的效果。
    pub fn cancel(&self) {
        match &self.control {
            CallControl::Started(handle) => handle.cancel(),
            CallControl::Collecting(collector) => collector.cancel(),
        }
    }
}

impl<M> fmt::Debug for ServerCall<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .finish()
    }
}

type StartFn<M> = Box<dyn FnOnce(M) -> CallHandle<M> + Send>;

enum Pending<M> {
    Waiting(StartFn<M>),
    Received(StartFn<M>, M),
    /// 适配器启动中；期间到达的取消把状态改为 `Finished`，启动完成后补做取消。
    Starting,
    Started(CallHandle<M>),
    Finished,
}

/// 单值入站方法的请求收集器。
struct SingleRequest<M> {
    sink: Arc<ResponseSink<M>>,
    state: Mutex<Pending<M>>,
}

impl<M: Send + 'static> SingleRequest<M> {
    fn new(sink: Arc<ResponseSink<M>>, start: StartFn<M>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            state: Mutex::new(Pending::Waiting(start)),
        })
    }

    fn cancel(&self) {
        let previous = mem::replace(&mut *self.state.lock(), Pending::Finished);
        match previous {
            Pending::Waiting(_) | Pending::Received(..) => {
                self.sink.abandon();
            }
            Pending::Started(handle) => handle.cancel(),
            Pending::Starting | Pending::Finished => {}
        }
    }
}

impl<M: Send + 'static> StreamObserver<M> for SingleRequest<M> {
    fn on_next(&self, item: M) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, Pending::Finished) {
            Pending::Waiting(start) => *state = Pending::Received(start, item),
            Pending::Received(..) => {
                drop(state);
                self.sink.error(Status::internal("too many requests"));
            }
            other => {
                *state = other;
                debug!("discarding request pushed after the call started");
            }
        }
    }

    fn on_error(&self, status: Status) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, Pending::Finished) {
            Pending::Waiting(_) | Pending::Received(..) => {
                drop(state);
                debug!(code = %status.code(), "inbound failed before the request completed");
                self.sink.abandon();
            }
            other => *state = other,
        }
    }

    fn on_completed(&self) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, Pending::Starting) {
            Pending::Received(start, request) => {
                drop(state);
                let handle = start(request);
                let mut state = self.state.lock();
                if matches!(*state, Pending::Starting) {
                    *state = Pending::Started(handle);
                } else {
                    drop(state);
                    handle.cancel();
                }
            }
            Pending::Waiting(_) => {
                *state = Pending::Finished;
                drop(state);
                self.sink
                    .error(Status::internal("half-closed without a request"));
            }
            other => *state = other,
        }
    }
}
