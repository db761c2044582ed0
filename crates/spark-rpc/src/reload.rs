//! 开发模式下的路由表重载节流。
//!
//! 宿主提供扫描函数（例如重新加载插件或重新读取服务清单），[`ReloadWatcher::poll`]
//! 保证两次扫描之间至少间隔 `interval`；扫描得到新表时经 [`RpcServer::publish`] 发布。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::RpcConfig;
use crate::error::RpcError;
use crate::routing::RoutingTable;
use crate::server::{RpcServer, SwapReport};

pub struct ReloadWatcher<M> {
    server: Arc<RpcServer<M>>,
    interval: Duration,
    /// `None` 表示间隔溢出了时钟范围，不再扫描。
    next_scan: Mutex<Option<Instant>>,
}

impl<M: Send + 'static> ReloadWatcher<M> {
    /// 首次 `poll` 立即扫描。
    pub fn new(server: Arc<RpcServer<M>>, interval: Duration) -> Self {
        Self {
            server,
            interval,
            next_scan: Mutex::new(Some(Instant::now())),
        }
    }

    pub fn with_config(server: Arc<RpcServer<M>>, config: &RpcConfig) -> Self {
        Self::new(server, config.reload_interval())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// 到期时执行一次扫描。
    ///
    /// 未到期、或扫描没有产出新表时返回 `Ok(None)`。扫描在节流锁内执行，
    /// 并发的调用者只有一个会真正扫描。
    pub fn poll<F>(&self, scan: F) -> Result<Option<SwapReport>, RpcError>
    where
        F: FnOnce() -> Result<Option<RoutingTable<M>>, RpcError>,
    {
        let now = Instant::now();
        if !Self::due(*self.next_scan.lock(), now) {
            return Ok(None);
        }

        let mut next_scan = self.next_scan.lock();
        if !Self::due(*next_scan, now) {
            return Ok(None);
        }
        *next_scan = now.checked_add(self.interval);

        match scan()? {
            Some(table) => self.server.publish(table).map(Some),
            None => {
                debug!("reload scan found nothing to publish");
                Ok(None)
            }
        }
    }

    fn due(next_scan: Option<Instant>, now: Instant) -> bool {
        next_scan.is_some_and(|deadline| now >= deadline)
    }
}
