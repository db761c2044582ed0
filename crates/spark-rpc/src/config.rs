//! # config：运行配置
//!
//! 以 TOML 描述，示例：
//!
//! ```toml
//! launch_mode = "development"
//! # 省略时按启动模式决定：仅开发模式开启会话追踪
//! session_tracking = true
//! reload_interval_ms = 500
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::tracker::{ActiveTracker, DisabledTracker, SessionTracker};

const DEFAULT_RELOAD_INTERVAL_MS: u64 = 2_000;

/// 启动模式。
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Normal,
    /// 开发模式：允许热替换路由表，默认开启会话追踪。
    Development,
}

/// 配置加载错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse rpc config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("reload_interval_ms must be greater than zero")]
    ZeroReloadInterval,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RpcConfig {
    pub launch_mode: LaunchMode,
    pub session_tracking: Option<bool>,
    pub reload_interval_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            launch_mode: LaunchMode::Normal,
            session_tracking: None,
            reload_interval_ms: DEFAULT_RELOAD_INTERVAL_MS,
        }
    }
}

impl RpcConfig {
    pub fn development() -> Self {
        Self {
            launch_mode: LaunchMode::Development,
            ..Self::default()
        }
    }

    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: RpcConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reload_interval_ms == 0 {
            return Err(ConfigError::ZeroReloadInterval);
        }
        Ok(())
    }

    /// 显式设置优先；否则仅开发模式开启。
    pub fn tracking_enabled(&self) -> bool {
        self.session_tracking
            .unwrap_or(self.launch_mode == LaunchMode::Development)
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    /// 依据配置选择登记簿实现。
    pub fn tracker(&self) -> Arc<dyn SessionTracker> {
        if self.tracking_enabled() {
            Arc::new(ActiveTracker::new())
        } else {
            Arc::new(DisabledTracker)
        }
    }
}
