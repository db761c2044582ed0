//! # value：Handler 面向的异步值模型
//!
//! - **结果值**：[`UnaryFuture`]，一次性地以一个值成功或以一个错误失败；
//! - **异步序列**：[`ValueStream`]，产出零个或多个条目后以完成或错误终止，
//!   消费方丢弃序列即向生产方传递取消；
//! - **入站泵**：[`RequestPump`] 是适配器自己喂入的中间序列，把传输层推送的入站事件
//!   1:1 转发成 Handler 可拉取的 [`Streaming`]。

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use futures::stream::{BoxStream, FusedStream, Stream, StreamExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::observer::StreamObserver;
use crate::status::{BoxError, Status};

/// Handler 产出的一次性结果值。
pub type UnaryFuture<T> = BoxFuture<'static, Result<T, BoxError>>;

/// Handler 产出的异步序列。
pub type ValueStream<T> = BoxStream<'static, Result<T, BoxError>>;

/// 由 [`RequestPump`] 喂入的入站序列。
///
/// 条目为 `Ok(item)`；传输层报告的错误以一个 `Err(status)` 出现并随后结束序列。
pub struct Streaming<T> {
    receiver: UnboundedReceiver<Result<T, Status>>,
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl<T> FusedStream for Streaming<T> {
    fn is_terminated(&self) -> bool {
        self.receiver.is_terminated()
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming").finish_non_exhaustive()
    }
}

type PumpHook = Box<dyn FnOnce() + Send>;

/// 入站泵：传输层推送 → 中间序列。
///
/// # 契约说明（What）
/// - `on_next` 转发为 `Ok(item)`；`on_error` 转发为一个 `Err(status)` 后关闭；
///   `on_completed` 直接关闭；
/// - 关闭之后的推送被静默丢弃（序列已终止，或消费者已放弃）；
/// - 可挂载一个终止钩子，在首个终止事件时执行一次，用于撤销会话登记。
pub struct RequestPump<T> {
    sender: UnboundedSender<Result<T, Status>>,
    on_terminal: Mutex<Option<PumpHook>>,
}

/// 创建一对入站泵与其喂入的序列。
pub fn request_pump<T: Send + 'static>() -> (Arc<RequestPump<T>>, Streaming<T>) {
    let (sender, receiver) = mpsc::unbounded();
    let pump = Arc::new(RequestPump {
        sender,
        on_terminal: Mutex::new(None),
    });
    (pump, Streaming { receiver })
}

impl<T: Send + 'static> RequestPump<T> {
    pub(crate) fn set_terminal_hook<H>(&self, hook: H)
    where
        H: FnOnce() + Send + 'static,
    {
        *self.on_terminal.lock() = Some(Box::new(hook));
    }

    /// 以正常完成关闭序列。
    pub fn close(&self) {
        self.sender.close_channel();
        self.run_terminal_hook();
    }

    /// 以错误关闭序列。
    pub fn fail(&self, status: Status) {
        if self.sender.unbounded_send(Err(status)).is_err() {
            debug!("inbound sequence already closed, dropping error");
        }
        self.sender.close_channel();
        self.run_terminal_hook();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn run_terminal_hook(&self) {
        let hook = self.on_terminal.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl<T: Send + 'static> StreamObserver<T> for RequestPump<T> {
    fn on_next(&self, item: T) {
        if self.sender.unbounded_send(Ok(item)).is_err() {
            debug!("inbound sequence closed or consumer gone, dropping item");
        }
    }

    fn on_error(&self, status: Status) {
        self.fail(status);
    }

    fn on_completed(&self) {
        self.close();
    }
}

impl<T> fmt::Debug for RequestPump<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestPump")
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
