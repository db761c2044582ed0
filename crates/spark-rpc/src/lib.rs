//! # spark-rpc
//!
//! ## 定位与职责（Why）
//! - 把应用逻辑以 RPC 方法的形式暴露在四类交互形态（一元、服务端流、客户端流、双向流）之上；
//!   Handler 面向统一的异步值模型编写（结果值 = `Future`，异步序列 = `Stream`），
//!   传输层则以推送回调（[`StreamObserver`]）工作，本 crate 负责两者之间的桥接；
//! - 在开发模式下支持整张路由表的原子热替换：替换前强制终止仍在进行的流式会话，
//!   保证旧 Handler 不再被引用。
//!
//! ## 架构嵌入（Where）
//! - `status`：对端可见的协议状态与错误转换；
//! - `observer` / `value`：推送通道、受保护的响应汇与入站泵；
//! - `server_calls` / `client_calls`：服务端与客户端各四个调用适配器；
//! - `interceptor` / `tracker` / `routing` / `server`：拦截链、会话登记簿、路由快照与热替换；
//! - `config` / `reload`：运行配置与重载节流。
//!
//! ## Feature 策略（Trade-offs）
//! - `tokio`（默认关闭）：提供 `TokioExecutor`；核心适配器只依赖 [`CallExecutor`] 契约，
//!   可接入任意执行器。
//!
//! 编码、HTTP/2 帧、TLS、监听与服务发现均由传输层负责，不在本 crate 范围内。

pub mod client_calls;
pub mod config;
pub mod context;
pub mod error;
pub mod interceptor;
pub mod observer;
pub mod reload;
pub mod routing;
pub mod runtime;
pub mod server;
pub mod server_calls;
pub mod service;
pub mod status;
pub mod tracker;
pub mod value;

pub use config::{ConfigError, LaunchMode, RpcConfig};
pub use context::{CallContext, Metadata};
pub use error::RpcError;
pub use interceptor::{Interceptor, InterceptorChain, order_by_priority};
pub use observer::{CallOutcome, CallState, ResponseSink, StreamObserver};
pub use reload::ReloadWatcher;
pub use routing::{HEALTH_SERVICE, RoutingTable, RoutingTableBuilder};
#[cfg(feature = "tokio")]
pub use runtime::TokioExecutor;
pub use runtime::CallExecutor;
pub use server::{RpcServer, ServerCall, SwapReport};
pub use service::{Cardinality, MethodHandler, MethodKind, ServiceDefinition};
pub use status::{BoxError, Code, Status, to_status_failure};
pub use tracker::{ActiveTracker, DisabledTracker, SessionTracker};
pub use value::{Streaming, UnaryFuture, ValueStream};
