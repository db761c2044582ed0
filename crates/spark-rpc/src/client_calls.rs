//! # client_calls：客户端四类调用适配器
//!
//! 客户端方向与服务端对称：调用方拿到结果值或异步序列，传输层仍以推送回调工作。
//! 每个适配器接收一个 `delegate`，即传输层发起调用的入口：
//! - 单值入站：`delegate(request, response_observer) -> cancel`，`cancel` 通知对端取消；
//! - 序列入站：`delegate(response_observer) -> request_observer`，
//!   适配器随后把请求序列逐条转发到返回的请求观察者。
//!
//! ## 行为契约（What）
//! - 结果值至多解析一次：首个条目获胜，之后的错误属于迟到信号而被丢弃；
//!   只有完成信号而没有条目时以 `INTERNAL` 失败；
//! - 调用方在终止信号之前丢弃结果值或响应序列，即视为取消：单值入站的调用执行
//!   `delegate` 返回的取消入口，序列入站的调用向请求观察者推送 `CANCELLED`。

use std::fmt;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{self, BoxFuture, Either};
use futures::stream::{FusedStream, Stream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::observer::StreamObserver;
use crate::status::{BoxError, Status, status_from_error, to_status_failure};
use crate::value::{Streaming, request_pump};

/// 传输层返回的对端取消入口。
pub type CancelCall = Box<dyn FnOnce() + Send>;

/// 客户端一次性结果；解析前被丢弃即取消调用。
pub struct UnaryResponse<T> {
    receiver: oneshot::Receiver<Result<T, Status>>,
    guard: CancelOnDrop,
}

impl<T> Future for UnaryResponse<T> {
    type Output = Result<T, Status>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let delivered = ready!(this.receiver.poll_unpin(cx));
        this.guard.disarm();
        Poll::Ready(match delivered {
            Ok(result) => result,
            Err(canceled) => Err(status_from_error(&canceled)),
        })
    }
}

impl<T> fmt::Debug for UnaryResponse<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnaryResponse").finish_non_exhaustive()
    }
}

/// 把推送回调收敛为一次性结果的观察者。
struct UnaryObserver<T> {
    slot: Mutex<Option<oneshot::Sender<Result<T, Status>>>>,
}

impl<T: Send + 'static> UnaryObserver<T> {
    fn resolve(&self, result: Result<T, Status>) {
        match self.slot.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!("client result already resolved, discarding late signal"),
        }
    }
}

impl<T: Send + 'static> StreamObserver<T> for UnaryObserver<T> {
    fn on_next(&self, item: T) {
        self.resolve(Ok(item));
    }

    fn on_error(&self, status: Status) {
        self.resolve(Err(status));
    }

    fn on_completed(&self) {
        // 首个条目已解析时 `resolve` 会丢弃这个信号。
        self.resolve(Err(Status::internal("call completed without a value")));
    }
}

fn unary_observer<T: Send + 'static>() -> (Arc<dyn StreamObserver<T>>, UnaryResponse<T>) {
    let (sender, receiver) = oneshot::channel();
    let observer = Arc::new(UnaryObserver {
        slot: Mutex::new(Some(sender)),
    });
    let response = UnaryResponse {
        receiver,
        guard: CancelOnDrop::disarmed(),
    };
    (observer, response)
}

/// 在析构时执行取消，调用正常结束后解除。
struct CancelOnDrop {
    cancel: Option<CancelCall>,
}

impl CancelOnDrop {
    fn new(cancel: CancelCall) -> Self {
        Self {
            cancel: Some(cancel),
        }
    }

    /// 向请求观察者推送 `CANCELLED`。
    fn notify<Req: Send + 'static>(requests: Arc<dyn StreamObserver<Req>>) -> Self {
        Self::new(Box::new(move || {
            requests.on_error(Status::cancelled("client dropped the call"));
        }))
    }

    fn disarmed() -> Self {
        Self { cancel: None }
    }

    fn disarm(&mut self) {
        self.cancel = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            debug!("client call dropped before completion, cancelling");
            cancel();
        }
    }
}

/// one→one。
pub fn one_to_one<Req, Resp, D>(request: Req, delegate: D) -> UnaryResponse<Resp>
where
    Resp: Send + 'static,
    D: FnOnce(Req, Arc<dyn StreamObserver<Resp>>) -> CancelCall,
{
    let (observer, mut response) = unary_observer();
    response.guard = CancelOnDrop::new(delegate(request, observer));
    response
}

/// one→many：响应经由入站泵转为可拉取的序列。
pub fn one_to_many<Req, Resp, D>(request: Req, delegate: D) -> ResponseStream<Resp>
where
    Resp: Send + 'static,
    D: FnOnce(Req, Arc<dyn StreamObserver<Resp>>) -> CancelCall,
{
    let (pump, responses) = request_pump::<Resp>();
    let cancel = delegate(request, pump as Arc<dyn StreamObserver<Resp>>);
    ResponseStream {
        responses,
        guard: CancelOnDrop::new(cancel),
    }
}

/// one→many 返回的响应序列；终止前被丢弃即取消调用。
pub struct ResponseStream<Resp> {
    responses: Streaming<Resp>,
    guard: CancelOnDrop,
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<Resp, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.responses.poll_next_unpin(cx);
        if is_terminal(&polled) {
            this.guard.disarm();
        }
        polled
    }
}

impl<Resp> FusedStream for ResponseStream<Resp> {
    fn is_terminated(&self) -> bool {
        self.responses.is_terminated()
    }
}

impl<Resp> fmt::Debug for ResponseStream<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("armed", &self.guard.cancel.is_some())
            .finish()
    }
}

fn is_terminal<T>(polled: &Poll<Option<Result<T, Status>>>) -> bool {
    matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_))))
}

/// many→one：边转发请求序列边等待结果；结果先到时停止转发。
pub async fn many_to_one<Req, Resp, S, E, D>(requests: S, delegate: D) -> Result<Resp, Status>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: Stream<Item = Result<Req, E>>,
    E: Into<BoxError>,
    D: FnOnce(Arc<dyn StreamObserver<Resp>>) -> Arc<dyn StreamObserver<Req>>,
{
    let (observer, response) = unary_observer::<Resp>();
    let request_observer = delegate(observer);
    let mut guard = CancelOnDrop::notify(Arc::clone(&request_observer));

    let forward = pin!(forward_requests(requests, request_observer));
    let outcome = match future::select(forward, response).await {
        Either::Left(((), response)) => response.await,
        Either::Right((outcome, _forward)) => outcome,
    };
    guard.disarm();
    outcome
}

/// many→many 返回的响应序列；同时驱动请求转发。
pub struct BidiResponses<Resp> {
    forward: Option<BoxFuture<'static, ()>>,
    responses: Streaming<Resp>,
    guard: CancelOnDrop,
}

impl<Resp> Stream for BidiResponses<Resp> {
    type Item = Result<Resp, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(forward) = this.forward.as_mut() {
            if forward.poll_unpin(cx).is_ready() {
                this.forward = None;
            }
        }
        let polled = this.responses.poll_next_unpin(cx);
        if is_terminal(&polled) {
            this.guard.disarm();
            this.forward = None;
        }
        polled
    }
}

impl<Resp> FusedStream for BidiResponses<Resp> {
    fn is_terminated(&self) -> bool {
        self.responses.is_terminated()
    }
}

impl<Resp> fmt::Debug for BidiResponses<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiResponses")
            .field("forwarding", &self.forward.is_some())
            .finish()
    }
}

/// many→many。
pub fn many_to_many<Req, Resp, S, E, D>(requests: S, delegate: D) -> BidiResponses<Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    S: Stream<Item = Result<Req, E>> + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    D: FnOnce(Arc<dyn StreamObserver<Resp>>) -> Arc<dyn StreamObserver<Req>>,
{
    let (pump, responses) = request_pump::<Resp>();
    let request_observer = delegate(pump as Arc<dyn StreamObserver<Resp>>);
    let guard = CancelOnDrop::notify(Arc::clone(&request_observer));
    BidiResponses {
        forward: Some(forward_requests(requests, request_observer).boxed()),
        responses,
        guard,
    }
}

async fn forward_requests<Req, S, E>(requests: S, observer: Arc<dyn StreamObserver<Req>>)
where
    S: Stream<Item = Result<Req, E>>,
    E: Into<BoxError>,
{
    let mut requests = pin!(requests);
    while let Some(item) = requests.next().await {
        match item {
            Ok(request) => observer.on_next(request),
            Err(error) => {
                observer.on_error(to_status_failure(error.into()));
                return;
            }
        }
    }
    observer.on_completed();
}
