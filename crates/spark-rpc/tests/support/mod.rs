#![allow(dead_code)]

//! 集成测试共用的传输层替身：记录推送事件，并支持等待终止信号。

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use futures::future::BoxFuture;
use spark_rpc::{CallExecutor, Status, StreamObserver};
use tokio::sync::Notify;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<T> {
    Item(T),
    Error(Status),
    Completed,
}

impl<T> Event<T> {
    fn is_terminal(&self) -> bool {
        !matches!(self, Event::Item(_))
    }
}

/// 记录型观察者，扮演传输层的出站（或客户端的入站）推送通道。
pub struct Recording<T> {
    events: Mutex<Vec<Event<T>>>,
    activity: Notify,
}

impl<T: Clone + Send + 'static> Recording<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            activity: Notify::new(),
        })
    }

    pub fn observer(self: &Arc<Self>) -> Arc<dyn StreamObserver<T>> {
        Arc::clone(self) as Arc<dyn StreamObserver<T>>
    }

    pub fn events(&self) -> Vec<Event<T>> {
        self.events.lock().clone()
    }

    pub fn items(&self) -> Vec<T> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Item(item) => Some(item.clone()),
                _ => None,
            })
            .collect()
    }

    /// 等待事件数量达到 `count`。
    pub async fn wait_for(&self, count: usize) -> Vec<Event<T>> {
        self.wait_until(|events| events.len() >= count).await
    }

    /// 等待终止信号出现。
    pub async fn wait_terminal(&self) -> Vec<Event<T>> {
        self.wait_until(|events| events.iter().any(Event::is_terminal))
            .await
    }

    async fn wait_until(&self, done: impl Fn(&[Event<T>]) -> bool) -> Vec<Event<T>> {
        tokio::time::timeout(WAIT_LIMIT, async {
            loop {
                let notified = self.activity.notified();
                {
                    let events = self.events.lock();
                    if done(&events) {
                        return events.clone();
                    }
                }
                notified.await;
            }
        })
        .await
        .expect("等待推送事件超时")
    }

    fn push(&self, event: Event<T>) {
        self.events.lock().push(event);
        self.activity.notify_one();
    }
}

impl<T: Clone + Send + 'static> StreamObserver<T> for Recording<T> {
    fn on_next(&self, item: T) {
        self.push(Event::Item(item));
    }

    fn on_error(&self, status: Status) {
        self.push(Event::Error(status));
    }

    fn on_completed(&self) {
        self.push(Event::Completed);
    }
}

/// 把驱动任务派发到当前测试所在的 Tokio 运行时。
struct SpawnOnTest;

impl CallExecutor for SpawnOnTest {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(tokio::spawn(task));
    }
}

pub fn executor() -> Arc<dyn CallExecutor> {
    Arc::new(SpawnOnTest)
}

/// 轮询等待条件成立，用于观察驱动任务在终止信号之后的收尾（如撤销会话登记）。
pub async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT_LIMIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("条件在限定时间内未成立");
}

/// 让出执行权若干次，使已派发的任务有机会继续推进。
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
