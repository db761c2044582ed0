//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义路由表构建、热替换与配置加载阶段的错误；
//! - 与 Handler 路径上的 [`Status`] 区分：这里的错误面向宿主进程，必要时再经
//!   [`From<RpcError> for Status`](Status) 转换给对端。
//!
//! ## 设计要求（What）
//! - 所有变体派生 `thiserror::Error`，可经 `?` 在宿主代码中传播；
//! - 转换为 [`Status`] 时挑选稳定的状态码，描述取 `Display` 输出。

use thiserror::Error;

use crate::config::ConfigError;
use crate::status::{Code, Status};

/// 注册表与服务器生命周期错误。
///
/// # 教案式说明
/// - **意图 (Why)**：构建快照、发布快照、关停之后的误用都需要明确告知宿主，而不是静默忽略；
/// - **契约 (What)**：
///   - [`RpcError::DuplicateMethod`]：同一全限定方法名出现两次，整张快照被拒绝；
///   - [`RpcError::NoServices`]：快照没有可对外暴露的服务（只剩健康检查服务也算）；
///   - [`RpcError::ShutDown`]：服务器已关停，不再接受新的快照；
///   - [`RpcError::Config`]：配置解析或校验失败。
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("method `{method}` is registered more than once")]
    DuplicateMethod { method: String },

    #[error("routing table has no services to expose")]
    NoServices,

    #[error("rpc server has been shut down")]
    ShutDown,

    #[error("invalid rpc configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<RpcError> for Status {
    fn from(error: RpcError) -> Self {
        let code = match &error {
            RpcError::DuplicateMethod { .. } => Code::AlreadyExists,
            RpcError::NoServices => Code::FailedPrecondition,
            RpcError::ShutDown => Code::Unavailable,
            RpcError::Config(_) => Code::InvalidArgument,
        };
        Status::new(code, error.to_string())
    }
}
