//! # status：对端可见的协议状态
//!
//! ## 角色定位（Why）
//! - 传输层只接受“状态码 + 描述”形式的错误，本模块给出统一的 [`Status`] 表达；
//! - 四类调用适配器在把错误推送给传输层之前，都经由 [`to_status_failure`] 做且仅做一次转换。
//!
//! ## 转换规则（What）
//! - 错误本身或其 `source()` 链上任意一环已是 [`Status`]：原样转发，不再二次包装；
//! - `futures::channel::oneshot::Canceled`：视为生产者自行取消，映射为 [`Code::Cancelled`]；
//! - 其余错误：包装为 [`Code::Unknown`]，描述取原错误的 `Display` 输出。

use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;

use futures::channel::oneshot;
use thiserror::Error;

/// Handler 路径上流转的类型擦除错误。
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// 协议状态码，取值与 gRPC 规范一致。
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// 线上传输使用的整数值。
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// 规范中的大写名称，用于日志与 `Display`。
    pub fn as_str(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 推送给对端的协议错误。
///
/// # 契约说明（What）
/// - `code` 决定对端的错误分类，`message` 为人类可读描述；
/// - 实现 [`std::error::Error`]，因此可以经 `?` 转换为 [`BoxError`] 在 Handler 中传播，
///   并在到达传输层前由 [`to_status_failure`] 原样取回。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: Cow<'static, str>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Cancelled, message)
    }

    pub fn unknown(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unimplemented(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn permission_denied(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 将 Handler 路径产生的任意错误转换为 [`Status`]。
///
/// # 执行逻辑（How）
/// 1. 先尝试按值 `downcast` 为 [`Status`]，命中即返回，避免克隆；
/// 2. 否则交给 [`status_from_error`] 沿 `source()` 链查找。
///
/// # 契约说明（What）
/// - 每个错误在推送至传输层的路径上只调用一次；
/// - 对已是 [`Status`] 的错误是恒等变换，因此即使上游已经包装过，也不会出现双重包装。
pub fn to_status_failure(error: BoxError) -> Status {
    match error.downcast::<Status>() {
        Ok(status) => *status,
        Err(error) => status_from_error(error.as_ref()),
    }
}

/// 借用版本的错误转换，供只持有 `&dyn Error` 的调用点使用。
pub fn status_from_error(error: &(dyn StdError + 'static)) -> Status {
    let mut cursor: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(current) = cursor {
        if let Some(status) = current.downcast_ref::<Status>() {
            return status.clone();
        }
        if current.is::<oneshot::Canceled>() {
            return Status::cancelled("value producer was cancelled");
        }
        cursor = current.source();
    }
    Status::unknown(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("repository lookup failed")]
    struct Wrapped(#[source] Status);

    #[derive(Debug, Error)]
    #[error("disk on fire")]
    struct Plain;

    #[test]
    fn status_passes_through_unchanged() {
        let original = Status::invalid_argument("name must not be empty");
        let translated = to_status_failure(Box::new(original.clone()));
        assert_eq!(translated, original);
    }

    #[test]
    fn status_in_source_chain_is_not_wrapped_again() {
        let inner = Status::permission_denied("tenant mismatch");
        let translated = to_status_failure(Box::new(Wrapped(inner.clone())));
        assert_eq!(translated, inner, "链上已有 Status 时必须原样取回");
    }

    #[test]
    fn foreign_error_becomes_unknown_with_description() {
        let translated = to_status_failure(Box::new(Plain));
        assert_eq!(translated.code(), Code::Unknown);
        assert_eq!(translated.message(), "disk on fire");
    }

    #[test]
    fn cancelled_producer_maps_to_cancelled() {
        let translated = to_status_failure(Box::new(oneshot::Canceled));
        assert_eq!(translated.code(), Code::Cancelled);
    }

    #[test]
    fn translation_is_idempotent() {
        let once = to_status_failure(Box::new(Plain));
        let twice = to_status_failure(Box::new(once.clone()));
        assert_eq!(once, twice);
    }

    #[test]
    fn display_carries_code_name() {
        let status = Status::internal("boom");
        assert_eq!(status.to_string(), "INTERNAL: boom");
        assert_eq!(Code::Unavailable.as_i32(), 14);
    }
}
