//! # service：方法 Handler 与服务定义
//!
//! ## 契约说明（What）
//! - 每个方法由“全限定名 + 形态（入站/出站基数）+ Handler 函数”描述；
//! - Handler 直接面向异步值模型：单个入站值或 [`Streaming`]，产出 [`UnaryFuture`]
//!   或 [`ValueStream`]；
//! - `*_fallible` 形式的构造函数允许 Handler 在调用当下同步失败（返回 `Err`），
//!   适配器会把它与“结果值以错误结束”同等对待。
//!
//! ## 使用方式（How）
//! ```ignore
//! let greeter = ServiceDefinition::builder("helloworld.Greeter")
//!     .method("SayHello", MethodHandler::unary(|name: String| async move {
//!         Ok::<_, Status>(format!("Hello {name}"))
//!     }))
//!     .build();
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt, TryFutureExt, TryStreamExt};

use crate::status::BoxError;
use crate::value::{Streaming, UnaryFuture, ValueStream};

/// 单向基数。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Cardinality {
    One,
    Many,
}

/// 方法形态：入站基数 × 出站基数。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct MethodKind {
    pub inbound: Cardinality,
    pub outbound: Cardinality,
}

impl MethodKind {
    pub const UNARY: MethodKind = MethodKind::new(Cardinality::One, Cardinality::One);
    pub const SERVER_STREAMING: MethodKind = MethodKind::new(Cardinality::One, Cardinality::Many);
    pub const CLIENT_STREAMING: MethodKind = MethodKind::new(Cardinality::Many, Cardinality::One);
    pub const BIDI_STREAMING: MethodKind = MethodKind::new(Cardinality::Many, Cardinality::Many);

    pub const fn new(inbound: Cardinality, outbound: Cardinality) -> Self {
        Self { inbound, outbound }
    }

    /// 任一方向为 `Many` 即视为流式调用，受会话登记簿追踪。
    pub fn is_streaming(self) -> bool {
        matches!(self.inbound, Cardinality::Many) || matches!(self.outbound, Cardinality::Many)
    }
}

pub type UnaryFn<M> = dyn Fn(M) -> Result<UnaryFuture<M>, BoxError> + Send + Sync;
pub type ServerStreamingFn<M> = dyn Fn(M) -> Result<ValueStream<M>, BoxError> + Send + Sync;
pub type ClientStreamingFn<M> = dyn Fn(Streaming<M>) -> Result<UnaryFuture<M>, BoxError> + Send + Sync;
pub type BidiStreamingFn<M> = dyn Fn(Streaming<M>) -> Result<ValueStream<M>, BoxError> + Send + Sync;

/// 类型擦除后的方法 Handler。
///
/// 克隆只复制内部 `Arc`，调用在受理时克隆一份，之后与路由表的替换无关。
pub enum MethodHandler<M> {
    Unary(Arc<UnaryFn<M>>),
    ServerStreaming(Arc<ServerStreamingFn<M>>),
    ClientStreaming(Arc<ClientStreamingFn<M>>),
    BidiStreaming(Arc<BidiStreamingFn<M>>),
}

impl<M> Clone for MethodHandler<M> {
    fn clone(&self) -> Self {
        match self {
            MethodHandler::Unary(f) => MethodHandler::Unary(Arc::clone(f)),
            MethodHandler::ServerStreaming(f) => MethodHandler::ServerStreaming(Arc::clone(f)),
            MethodHandler::ClientStreaming(f) => MethodHandler::ClientStreaming(Arc::clone(f)),
            MethodHandler::BidiStreaming(f) => MethodHandler::BidiStreaming(Arc::clone(f)),
        }
    }
}

impl<M> fmt::Debug for MethodHandler<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MethodHandler").field(&self.kind()).finish()
    }
}

impl<M> MethodHandler<M> {
    pub fn kind(&self) -> MethodKind {
        match self {
            MethodHandler::Unary(_) => MethodKind::UNARY,
            MethodHandler::ServerStreaming(_) => MethodKind::SERVER_STREAMING,
            MethodHandler::ClientStreaming(_) => MethodKind::CLIENT_STREAMING,
            MethodHandler::BidiStreaming(_) => MethodKind::BIDI_STREAMING,
        }
    }
}

impl<M: Send + 'static> MethodHandler<M> {
    /// one→one，Handler 为返回结果值的异步函数。
    pub fn unary<F, Fut, E>(handler: F) -> Self
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::Unary(Arc::new(move |request: M| -> Result<UnaryFuture<M>, BoxError> {
            Ok(handler(request).map_err(Into::into).boxed())
        }))
    }

    /// one→one，Handler 可在调用当下同步失败。
    pub fn unary_fallible<F>(handler: F) -> Self
    where
        F: Fn(M) -> Result<UnaryFuture<M>, BoxError> + Send + Sync + 'static,
    {
        Self::Unary(Arc::new(handler))
    }

    /// one→many。
    pub fn server_streaming<F, S, E>(handler: F) -> Self
    where
        F: Fn(M) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<M, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::ServerStreaming(Arc::new(move |request: M| -> Result<ValueStream<M>, BoxError> {
            Ok(handler(request).map_err(Into::into).boxed())
        }))
    }

    pub fn server_streaming_fallible<F>(handler: F) -> Self
    where
        F: Fn(M) -> Result<ValueStream<M>, BoxError> + Send + Sync + 'static,
    {
        Self::ServerStreaming(Arc::new(handler))
    }

    /// many→one。
    pub fn client_streaming<F, Fut, E>(handler: F) -> Self
    where
        F: Fn(Streaming<M>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::ClientStreaming(Arc::new(
            move |requests: Streaming<M>| -> Result<UnaryFuture<M>, BoxError> {
                Ok(handler(requests).map_err(Into::into).boxed())
            },
        ))
    }

    pub fn client_streaming_fallible<F>(handler: F) -> Self
    where
        F: Fn(Streaming<M>) -> Result<UnaryFuture<M>, BoxError> + Send + Sync + 'static,
    {
        Self::ClientStreaming(Arc::new(handler))
    }

    /// many→many。
    pub fn bidi_streaming<F, S, E>(handler: F) -> Self
    where
        F: Fn(Streaming<M>) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<M, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::BidiStreaming(Arc::new(
            move |requests: Streaming<M>| -> Result<ValueStream<M>, BoxError> {
                Ok(handler(requests).map_err(Into::into).boxed())
            },
        ))
    }

    pub fn bidi_streaming_fallible<F>(handler: F) -> Self
    where
        F: Fn(Streaming<M>) -> Result<ValueStream<M>, BoxError> + Send + Sync + 'static,
    {
        Self::BidiStreaming(Arc::new(handler))
    }
}

/// 注册到路由表中的单个方法。
pub struct MethodDefinition<M> {
    full_name: Arc<str>,
    handler: MethodHandler<M>,
}

impl<M> MethodDefinition<M> {
    /// 全限定名：`<service>/<method>`。
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn kind(&self) -> MethodKind {
        self.handler.kind()
    }

    pub fn handler(&self) -> &MethodHandler<M> {
        &self.handler
    }

    pub(crate) fn into_parts(self) -> (Arc<str>, MethodHandler<M>) {
        (self.full_name, self.handler)
    }
}

impl<M> fmt::Debug for MethodDefinition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDefinition")
            .field("full_name", &self.full_name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// 一组同属某个服务的方法。
pub struct ServiceDefinition<M> {
    name: Arc<str>,
    methods: Vec<MethodDefinition<M>>,
}

impl<M> ServiceDefinition<M> {
    pub fn builder(name: impl Into<Arc<str>>) -> ServiceBuilder<M> {
        ServiceBuilder {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDefinition<M>] {
        &self.methods
    }

    pub(crate) fn into_parts(self) -> (Arc<str>, Vec<MethodDefinition<M>>) {
        (self.name, self.methods)
    }
}

impl<M> fmt::Debug for ServiceDefinition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("methods", &self.methods)
            .finish()
    }
}

/// [`ServiceDefinition`] 构建器。
pub struct ServiceBuilder<M> {
    name: Arc<str>,
    methods: Vec<MethodDefinition<M>>,
}

impl<M> ServiceBuilder<M> {
    /// 追加一个方法；`method` 为短名，全限定名由服务名拼接得出。
    pub fn method(mut self, method: &str, handler: MethodHandler<M>) -> Self {
        let full_name: Arc<str> = Arc::from(format!("{}/{}", self.name, method));
        self.methods.push(MethodDefinition { full_name, handler });
        self
    }

    pub fn build(self) -> ServiceDefinition<M> {
        ServiceDefinition {
            name: self.name,
            methods: self.methods,
        }
    }
}
