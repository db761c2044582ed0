//! # tracker：流式会话登记簿
//!
//! ## 核心意图（Why）
//! - 热替换路由表前，需要让所有仍在进行的流式调用释放对旧 Handler 的引用；
//!   登记簿记录每个打开的推送端点，`drain` 时逐一强制终止；
//! - 生产环境通常不需要热替换，[`DisabledTracker`] 让登记操作退化为空操作。
//!
//! ## 行为契约（What）
//! - `track`：登记一个会话；禁用变体下为空操作；
//! - `untrack`：幂等移除，返回本次是否真正移除；
//! - `drain`：终止当前登记的每个会话并移除，返回终止数量；
//! - 会话的归属由“谁把它从表中移除”决定：并发的 `untrack` 与 `drain` 只有一方拿到条目，
//!   因此同一会话不会被终止两次；`drain` 期间新登记的会话不受影响，留待下一次排空。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

/// 会话标识，进程内单调递增。
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SessionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 会话所登记的推送方向。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    /// 入站泵：终止即以完成关闭入站序列。
    Inbound,
    /// 出站响应汇：终止即停止生产并向传输层推送完成。
    Outbound,
}

/// 强制终止句柄。
///
/// 实现必须是非阻塞的，且重复调用不产生额外的可观察效果。
pub trait Terminate: Send + Sync {
    fn terminate(&self);
}

/// 一个流式调用在某个方向上的登记记录。
#[derive(Clone)]
pub struct Session {
    id: SessionId,
    method: Arc<str>,
    direction: Direction,
    handle: Arc<dyn Terminate>,
}

impl Session {
    pub fn new(method: Arc<str>, direction: Direction, handle: Arc<dyn Terminate>) -> Self {
        Self {
            id: SessionId::next(),
            method,
            direction,
            handle,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn terminate(&self) {
        self.handle.terminate();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("direction", &self.direction)
            .finish()
    }
}

/// 流式会话登记簿契约。
pub trait SessionTracker: Send + Sync + 'static {
    fn track(&self, session: Session);

    fn untrack(&self, id: SessionId) -> bool;

    fn drain(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 禁用变体返回 `false`，热替换据此跳过排空。
    fn is_enabled(&self) -> bool;
}

/// 不做任何登记的变体，用于不需要热替换排空的常规运行。
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledTracker;

impl SessionTracker for DisabledTracker {
    fn track(&self, _session: Session) {}

    fn untrack(&self, _id: SessionId) -> bool {
        false
    }

    fn drain(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        0
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// 基于 `DashMap` 的登记簿。
#[derive(Debug, Default)]
pub struct ActiveTracker {
    sessions: DashMap<SessionId, Session>,
}

impl ActiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前登记的会话标识快照，按登记先后排序。
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl SessionTracker for ActiveTracker {
    fn track(&self, session: Session) {
        debug!(
            session = %session.id(),
            method = session.method(),
            direction = ?session.direction(),
            "tracking streaming session"
        );
        self.sessions.insert(session.id(), session);
    }

    fn untrack(&self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            debug!(session = %id, "streaming session finished");
        }
        removed
    }

    fn drain(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            // 先移除再终止：分片锁在 `remove` 返回时已释放，终止回调可安全地再次访问登记簿。
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.terminate();
                drained += 1;
            }
        }
        drained
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[derive(Default)]
    struct CountingHandle {
        hits: AtomicUsize,
    }

    impl Terminate for CountingHandle {
        fn terminate(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(handle: &Arc<CountingHandle>) -> Session {
        Session::new(
            Arc::from("demo.Stream/Tick"),
            Direction::Outbound,
            Arc::clone(handle) as Arc<dyn Terminate>,
        )
    }

    #[test]
    fn drain_terminates_every_session_once() {
        let tracker = ActiveTracker::new();
        let handles: Vec<_> = (0..3).map(|_| Arc::new(CountingHandle::default())).collect();
        for handle in &handles {
            tracker.track(session(handle));
        }

        assert_eq!(tracker.len(), 3);
        let ids = tracker.session_ids();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "按登记先后排序");
        assert_eq!(tracker.drain(), 3);
        assert!(tracker.is_empty());
        assert_eq!(tracker.drain(), 0, "二次排空不应再终止任何会话");
        for handle in &handles {
            assert_eq!(handle.hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn untrack_is_idempotent() {
        let tracker = ActiveTracker::new();
        let handle = Arc::new(CountingHandle::default());
        let session = session(&handle);
        let id = session.id();
        tracker.track(session);

        assert!(tracker.untrack(id));
        assert!(!tracker.untrack(id));
        assert_eq!(tracker.drain(), 0);
        assert_eq!(handle.hits.load(Ordering::SeqCst), 0, "已移除的会话不应被排空");
    }

    #[test]
    fn disabled_tracker_keeps_nothing() {
        let tracker = DisabledTracker;
        let handle = Arc::new(CountingHandle::default());
        tracker.track(session(&handle));

        assert!(tracker.is_empty());
        assert!(!tracker.is_enabled());
        assert_eq!(tracker.drain(), 0);
        assert_eq!(handle.hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_untrack_and_drain_never_double_terminate() {
        let tracker = Arc::new(ActiveTracker::new());
        let handles: Vec<_> = (0..64).map(|_| Arc::new(CountingHandle::default())).collect();
        let mut ids = Vec::new();
        for handle in &handles {
            let session = session(handle);
            ids.push(session.id());
            tracker.track(session);
        }

        let remover = {
            let tracker = Arc::clone(&tracker);
            let ids = ids.clone();
            thread::spawn(move || ids.into_iter().filter(|id| tracker.untrack(*id)).count())
        };
        let drained = tracker.drain();
        let removed = remover.join().expect("移除线程不应 panic");

        assert_eq!(drained + removed, handles.len());
        assert!(tracker.is_empty());
        let terminated: usize = handles
            .iter()
            .map(|handle| handle.hits.load(Ordering::SeqCst))
            .sum();
        assert_eq!(terminated, drained);
        assert!(handles.iter().all(|h| h.hits.load(Ordering::SeqCst) <= 1));
    }
}
