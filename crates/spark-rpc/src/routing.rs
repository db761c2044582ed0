//! # routing：不可变的路由表快照
//!
//! ## 角色定位（Why）
//! - 热替换以“整张快照替换”实现：新表完全构建、校验并排好拦截器之后才会发布，
//!   发布后任何调用都不会看到半更新的表；
//! - 快照本身不可变，调用在受理时克隆所需的 Handler，此后与快照的生命周期无关。
//!
//! ## 校验规则（What）
//! - 同一全限定方法名只能注册一次，否则返回 [`RpcError::DuplicateMethod`]；
//! - 至少包含一个健康检查之外的服务，否则返回 [`RpcError::NoServices`]；
//! - 拦截器在构建时按优先级排序一次，之后不再变化。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use crate::error::RpcError;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::service::{MethodHandler, ServiceDefinition};

/// 标准健康检查服务名；只注册它的表视为空表。
pub const HEALTH_SERVICE: &str = "grpc.health.v1.Health";

pub struct RoutingTable<M> {
    revision: u64,
    services: Vec<Arc<str>>,
    methods: HashMap<Arc<str>, MethodHandler<M>>,
    interceptors: InterceptorChain,
}

impl<M> RoutingTable<M> {
    pub fn builder() -> RoutingTableBuilder<M> {
        RoutingTableBuilder {
            revision: 1,
            services: Vec::new(),
            interceptors: Vec::new(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 已注册的服务名，按注册顺序。
    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|name| &**name)
    }

    /// 全部全限定方法名，按字典序。
    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.methods.keys().map(|name| &**name).collect();
        methods.sort_unstable();
        methods
    }

    pub fn resolve(&self, method: &str) -> Option<&MethodHandler<M>> {
        self.methods.get(method)
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }
}

impl<M> fmt::Debug for RoutingTable<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingTable")
            .field("revision", &self.revision)
            .field("services", &self.services)
            .field("methods", &self.methods.len())
            .field("interceptors", &self.interceptors)
            .finish()
    }
}

pub struct RoutingTableBuilder<M> {
    revision: u64,
    services: Vec<ServiceDefinition<M>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl<M> RoutingTableBuilder<M> {
    /// 快照修订号，仅用于日志与诊断；缺省为 1。
    pub fn revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn service(mut self, service: ServiceDefinition<M>) -> Self {
        self.services.push(service);
        self
    }

    /// 注册顺序即同优先级时的执行顺序。
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Result<RoutingTable<M>, RpcError> {
        let mut services: Vec<Arc<str>> = Vec::new();
        let mut methods = HashMap::new();

        for service in self.services {
            let (name, definitions) = service.into_parts();
            if !services.contains(&name) {
                services.push(name);
            }
            for definition in definitions {
                let (full_name, handler) = definition.into_parts();
                match methods.entry(full_name) {
                    Entry::Occupied(entry) => {
                        return Err(RpcError::DuplicateMethod {
                            method: entry.key().to_string(),
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(handler);
                    }
                }
            }
        }

        if services.iter().all(|name| &**name == HEALTH_SERVICE) {
            return Err(RpcError::NoServices);
        }

        Ok(RoutingTable {
            revision: self.revision,
            services,
            methods,
            interceptors: InterceptorChain::new(self.interceptors),
        })
    }
}
