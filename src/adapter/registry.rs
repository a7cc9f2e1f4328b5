//! Kind → adapter factory lookup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::{AdapterContext, AgentAdapter, AgentConfig, PtyAdapter, PtyConfig, SessionAdapter};
use crate::error::RelayError;
use crate::session::validate_kind;
use crate::Result;

/// Builds one adapter instance bound to one session.
pub type AdapterFactory =
    Arc<dyn Fn(AdapterContext) -> Result<Arc<dyn SessionAdapter>> + Send + Sync>;

/// Registered session kinds.
///
/// Built once at bootstrap and handed to the orchestrator; there is no
/// global registry.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `pty` and `agent` kinds.
    pub fn with_defaults(pty: PtyConfig, agent: AgentConfig) -> Self {
        let mut registry = Self::new();
        registry.insert("pty", move |context| {
            Ok(Arc::new(PtyAdapter::new(context, pty.clone())) as Arc<dyn SessionAdapter>)
        });
        registry.insert("agent", move |context| {
            Ok(Arc::new(AgentAdapter::new(context, agent.clone())) as Arc<dyn SessionAdapter>)
        });
        registry
    }

    /// Register `factory` for `kind`, replacing any earlier registration.
    pub fn register<F>(&mut self, kind: &str, factory: F) -> Result<()>
    where
        F: Fn(AdapterContext) -> Result<Arc<dyn SessionAdapter>> + Send + Sync + 'static,
    {
        validate_kind(kind)?;
        self.insert(kind, factory);
        Ok(())
    }

    fn insert<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(AdapterContext) -> Result<Arc<dyn SessionAdapter>> + Send + Sync + 'static,
    {
        debug!(kind, "Registered session kind");
        self.factories.insert(kind.to_string(), Arc::new(factory));
    }

    /// Build an adapter for `kind`.
    pub fn create(&self, kind: &str, context: AdapterContext) -> Result<Arc<dyn SessionAdapter>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| RelayError::UnknownKind(kind.to_string()))?;
        factory(context)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{EventSink, PtySize, StartOptions};
    use crate::session::SessionId;
    use async_trait::async_trait;

    struct NullAdapter;

    #[async_trait]
    impl SessionAdapter for NullAdapter {
        fn kind(&self) -> &str {
            "null"
        }
        async fn start(&self, _options: &StartOptions) -> Result<()> {
            Ok(())
        }
        async fn write_input(&self, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn resize(&self, _size: PtySize) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn context(kind: &str) -> AdapterContext {
        let session_id = SessionId::new(kind).unwrap();
        let (sink, _rx) = EventSink::channel(session_id.clone(), 1);
        AdapterContext { session_id, sink }
    }

    #[test]
    fn test_defaults_registered() {
        let registry = AdapterRegistry::with_defaults(PtyConfig::default(), AgentConfig::default());
        assert_eq!(registry.kinds(), vec!["agent", "pty"]);
        assert!(registry.contains("pty"));
        assert!(!registry.contains("bogus"));

        let adapter = registry.create("pty", context("pty")).unwrap();
        assert_eq!(adapter.kind(), "pty");
    }

    #[test]
    fn test_register_custom_kind() {
        let mut registry = AdapterRegistry::new();
        registry
            .register("null", |_| Ok(Arc::new(NullAdapter) as Arc<dyn SessionAdapter>))
            .unwrap();

        let adapter = registry.create("null", context("null")).unwrap();
        assert_eq!(adapter.kind(), "null");
    }

    #[test]
    fn test_register_rejects_malformed_kind() {
        let mut registry = AdapterRegistry::new();
        let result = registry.register("Not A Kind", |_| {
            Ok(Arc::new(NullAdapter) as Arc<dyn SessionAdapter>)
        });
        assert!(matches!(result, Err(RelayError::Configuration(_))));
        assert!(registry.kinds().is_empty());
    }

    #[test]
    fn test_create_unknown_kind() {
        let registry = AdapterRegistry::new();
        let result = registry.create("bogus", context("bogus"));
        assert!(matches!(result, Err(RelayError::UnknownKind(_))));
    }
}
