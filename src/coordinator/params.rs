//! Parameters identifying an indexed cache within a coordinator

use std::any::TypeId;
use std::sync::Arc;

use crate::indexed::InMemoryDecoratorConfig;
use crate::store::Serializer;

/// Name, serializers and decoration of an indexed cache.
///
/// Requesting the same name twice from one coordinator must use compatible
/// parameters.
pub struct IndexedCacheParameters<K, V> {
    cache_name: String,
    key_serializer: Arc<dyn Serializer<K>>,
    value_serializer: Arc<dyn Serializer<V>>,
    decorator: Option<InMemoryDecoratorConfig>,
}

impl<K, V> Clone for IndexedCacheParameters<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache_name: self.cache_name.clone(),
            key_serializer: self.key_serializer.clone(),
            value_serializer: self.value_serializer.clone(),
            decorator: self.decorator,
        }
    }
}

impl<K: 'static, V: 'static> std::fmt::Debug for IndexedCacheParameters<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedCacheParameters")
            .field("cache_name", &self.cache_name)
            .field("key_serializer", &self.key_serializer.serializer_name())
            .field("value_serializer", &self.value_serializer.serializer_name())
            .field("decorator", &self.decorator)
            .finish()
    }
}

impl<K: 'static, V: 'static> IndexedCacheParameters<K, V> {
    pub fn new(
        cache_name: &str,
        key_serializer: impl Serializer<K>,
        value_serializer: impl Serializer<V>,
    ) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            key_serializer: Arc::new(key_serializer),
            value_serializer: Arc::new(value_serializer),
            decorator: None,
        }
    }

    /// Add an in-memory decoration with write batching
    pub fn with_decorator(mut self, decorator: InMemoryDecoratorConfig) -> Self {
        self.decorator = Some(decorator);
        self
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn key_serializer(&self) -> &Arc<dyn Serializer<K>> {
        &self.key_serializer
    }

    pub fn value_serializer(&self) -> &Arc<dyn Serializer<V>> {
        &self.value_serializer
    }

    pub fn decorator(&self) -> Option<&InMemoryDecoratorConfig> {
        self.decorator.as_ref()
    }

    pub(crate) fn signature(&self) -> CacheSignature {
        CacheSignature {
            cache_name: self.cache_name.clone(),
            key_serializer: (self.key_serializer.serializer_id(), self.key_serializer.serializer_name()),
            value_serializer: (
                self.value_serializer.serializer_id(),
                self.value_serializer.serializer_name(),
            ),
            decorator: self.decorator,
        }
    }
}

/// Type-erased view of the parameters a cache was registered with
#[derive(Debug, Clone)]
pub(crate) struct CacheSignature {
    cache_name: String,
    key_serializer: (TypeId, &'static str),
    value_serializer: (TypeId, &'static str),
    decorator: Option<InMemoryDecoratorConfig>,
}

impl CacheSignature {
    pub(crate) fn cache_name(&self) -> &str {
        &self.cache_name
    }

    /// Describe every difference between the registered and requested caches
    pub(crate) fn mismatches(&self, requested: &CacheSignature) -> Vec<String> {
        let mut mismatches = Vec::new();
        if self.cache_name != requested.cache_name {
            mismatches.push(format!(
                " * Requested cache name ({}) doesn't match current cache name ({})",
                requested.cache_name, self.cache_name
            ));
        }
        if self.key_serializer.0 != requested.key_serializer.0 {
            mismatches.push(format!(
                " * Requested key serializer type ({}) doesn't match current cache type ({})",
                requested.key_serializer.1, self.key_serializer.1
            ));
        }
        if self.value_serializer.0 != requested.value_serializer.0 {
            mismatches.push(format!(
                " * Requested value serializer type ({}) doesn't match current cache type ({})",
                requested.value_serializer.1, self.value_serializer.1
            ));
        }
        if self.decorator != requested.decorator {
            mismatches.push(format!(
                " * Requested cache decorator type ({:?}) doesn't match current cache type ({:?})",
                requested.decorator, self.decorator
            ));
        }
        mismatches
    }
}
