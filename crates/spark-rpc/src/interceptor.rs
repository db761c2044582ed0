//! # interceptor：按优先级排序的调用拦截链
//!
//! ## 排序契约（What）
//! - 优先级为整数，缺省 0，数值越小越先执行；
//! - 使用稳定排序，优先级相同时保持注册顺序，注册顺序因此是确定的次级排序键；
//! - 排序结果在路由表快照构建时固定，之后不可变。
//!
//! ## 执行契约（How）
//! - 入站阶段：按列表顺序调用 [`Interceptor::on_request`]，任一拦截器拒绝即中止，
//!   已进入的拦截器按逆序收到 [`Interceptor::on_close`]；
//! - 响应阶段：调用的响应汇到达终止态时，按逆序调用 [`Interceptor::on_close`]，
//!   与常见的嵌套中间件约定一致。

use std::fmt;
use std::sync::Arc;

use crate::context::CallContext;
use crate::observer::CallOutcome;
use crate::status::Status;

/// 服务端调用拦截器。
pub trait Interceptor: Send + Sync + 'static {
    /// 日志中使用的名称。
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn priority(&self) -> i32 {
        0
    }

    /// 入站阶段；返回错误即拒绝该调用。
    fn on_request(&self, ctx: &mut CallContext) -> Result<(), Status> {
        let _ = ctx;
        Ok(())
    }

    /// 响应阶段，每个已进入的调用恰好一次。
    fn on_close(&self, ctx: &CallContext, outcome: &CallOutcome) {
        let _ = (ctx, outcome);
    }
}

/// 具备优先级的条目，供 [`order_by_priority`] 排序。
pub trait Prioritized {
    fn priority(&self) -> i32;
}

impl<I: Interceptor + ?Sized> Prioritized for Arc<I> {
    fn priority(&self) -> i32 {
        Interceptor::priority(&**self)
    }
}

/// 按升序优先级稳定排序；同优先级保持输入顺序。
pub fn order_by_priority<T: Prioritized>(mut items: Vec<T>) -> Vec<T> {
    items.sort_by_key(|item| item.priority());
    items
}

/// 排序完成、不可变的拦截器链。
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl InterceptorChain {
    /// 以注册顺序传入，内部完成排序。
    pub fn new(registered: Vec<Arc<dyn Interceptor>>) -> Self {
        Self {
            interceptors: order_by_priority(registered).into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Interceptor>> {
        self.interceptors.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.interceptors
            .iter()
            .map(|interceptor| interceptor.name().to_owned())
            .collect()
    }

    /// 入站阶段。拒绝时，已进入的拦截器按逆序收到失败结果。
    pub fn enter(&self, ctx: &mut CallContext) -> Result<(), Status> {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            if let Err(status) = interceptor.on_request(ctx) {
                tracing::warn!(
                    interceptor = interceptor.name(),
                    method = ctx.method(),
                    code = %status.code(),
                    "call rejected by interceptor"
                );
                let outcome = CallOutcome::Failed(status.clone());
                for entered in self.interceptors[..index].iter().rev() {
                    entered.on_close(ctx, &outcome);
                }
                return Err(status);
            }
        }
        Ok(())
    }

    /// 响应阶段，逆序执行。
    pub fn close(&self, ctx: &CallContext, outcome: &CallOutcome) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_close(ctx, outcome);
        }
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
