//! # runtime：订阅即派发
//!
//! 适配器“订阅”结果值或异步序列的方式，是把驱动任务交给 [`CallExecutor`]，
//! 随后立即把控制权还给传输层；后续进展全部经由订阅时给出的推送通道完成。
//! 这是每个调用唯一的挂起点。

use std::sync::Arc;

use futures::future::BoxFuture;

/// 驱动任务的派发契约。
///
/// # 契约说明（What）
/// - `spawn` 不得阻塞调用线程，也不得在调用线程内同步跑完任务；
/// - 任务必须最终被轮询至结束或被中止，实现方不得静默丢弃。
pub trait CallExecutor: Send + Sync + 'static {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

impl<E: CallExecutor + ?Sized> CallExecutor for Arc<E> {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        (**self).spawn(task)
    }
}

/// 基于 Tokio 运行时句柄的执行器。
#[cfg(feature = "tokio")]
#[derive(Clone, Debug)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// 绑定当前线程所在的 Tokio 运行时。
    ///
    /// # Panics
    /// 调用线程不在 Tokio 运行时上下文中时 panic，与 `Handle::current` 一致。
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

#[cfg(feature = "tokio")]
impl CallExecutor for TokioExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(task));
    }
}

#[cfg(all(test, feature = "tokio"))]
mod tests {
    use super::*;
    use futures::FutureExt;
    use futures::channel::oneshot;

    #[tokio::test]
    async fn tokio_executor_runs_spawned_task() {
        let executor = TokioExecutor::current();
        let (tx, rx) = oneshot::channel();
        executor.spawn(
            async move {
                let _ = tx.send(42);
            }
            .boxed(),
        );
        assert_eq!(rx.await, Ok(42));
    }
}
