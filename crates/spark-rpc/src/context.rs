//! 调用上下文：方法身份、形态与请求元数据，拦截器在入站阶段读写它。

use std::sync::Arc;

use crate::service::MethodKind;

/// 请求元数据（头部），保持插入顺序，同名键可重复。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// 返回首个同名条目的值。
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 移除所有同名条目，返回被移除的数量。
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::new();
        for (key, value) in iter {
            metadata.insert(key, value);
        }
        metadata
    }
}

/// 单次调用的上下文。
///
/// - `method` 为全限定方法名（`package.Service/Method`）；
/// - `kind` 在受理时由路由表解析得出，之后不再变化。
#[derive(Clone, Debug)]
pub struct CallContext {
    method: Arc<str>,
    kind: MethodKind,
    metadata: Metadata,
}

impl CallContext {
    pub fn new(method: Arc<str>, kind: MethodKind, metadata: Metadata) -> Self {
        Self {
            method,
            kind,
            metadata,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// 方法名中 `/` 之前的服务部分。
    pub fn service(&self) -> &str {
        self.method
            .split_once('/')
            .map_or(&*self.method, |(service, _)| service)
    }

    pub fn kind(&self) -> MethodKind {
        self.kind
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
