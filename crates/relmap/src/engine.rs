//! The engine: the explicit, immutable configuration every unit of work is opened from.
//!
//! An [`Engine`] owns the descriptor registry, the shared second-level cache
//! and the default [`SessionConfig`]. It is cheap to share behind an `Arc`
//! and carries no global state.
//!
//! # Example
//!
//! ```rust,ignore
//! use relmap::prelude::*;
//!
//! let engine = Engine::builder()
//!     .metadata(|| Registry::builder().entity(order).entity(line).build())
//!     .cache(CacheConfig::new())
//!     .build()?;
//!
//! let mut session = engine.open_session(executor);
//! ```

use relmap_cache::{CacheConfig, CacheProvider, CacheStats, SecondLevelCache};
use relmap_core::{
    EntityDescriptor, EntityRef, Error, Executor, Identity, Instance, MetadataSource, Registry,
    Result, Value,
};
use relmap_session::{Session, SessionConfig};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// Shared configuration for units of work.
#[derive(Debug, Clone)]
pub struct Engine {
    registry: Arc<Registry>,
    cache: Option<Arc<SecondLevelCache>>,
    config: SessionConfig,
}

/// What an engine was built with, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub entities: Vec<String>,
    /// `(entity, region, strategy)` of every cached entity type.
    pub cached: Vec<(String, String, String)>,
    pub second_level_cache: bool,
    pub session: SessionConfig,
}

impl Engine {
    /// Create an engine builder.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// An engine over `registry` with no second-level cache.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            cache: None,
            config: SessionConfig::default(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> Option<&Arc<SecondLevelCache>> {
        self.cache.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Second-level cache counters, if a cache is configured.
    pub fn cache_statistics(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|c| c.statistics())
    }

    /// Open a unit of work over `executor` with the engine's default configuration.
    pub fn open_session<E: Executor>(&self, executor: E) -> Session<E> {
        self.open_session_with(executor, self.config.clone())
    }

    /// Open a unit of work with an explicit configuration.
    pub fn open_session_with<E: Executor>(&self, executor: E, config: SessionConfig) -> Session<E> {
        tracing::debug!(
            auto_begin = config.auto_begin,
            second_level_cache = config.use_second_level_cache && self.cache.is_some(),
            "Opening unit of work"
        );
        Session::new(
            executor,
            Arc::clone(&self.registry),
            self.cache.clone(),
            config,
        )
    }

    pub fn descriptor(&self, entity: &str) -> Result<Arc<EntityDescriptor>> {
        self.registry.require(entity).map(Arc::clone)
    }

    /// A new, unmanaged instance of `entity` with its primary key set.
    pub fn instance(&self, entity: &str, key: impl Into<Value>) -> Result<Instance> {
        let descriptor = self.descriptor(entity)?;
        let primary_key = descriptor.primary_key().to_string();
        Instance::new(descriptor).with(&primary_key, key)
    }

    /// Like [`instance`](Self::instance), wrapped as a shareable [`EntityRef`].
    pub fn entity(&self, entity: &str, key: impl Into<Value>) -> Result<EntityRef> {
        Ok(Arc::new(RwLock::new(self.instance(entity, key)?)))
    }

    /// The identity `(entity, key)` would have, checked against the registry.
    pub fn identity(&self, entity: &str, key: impl Into<Value>) -> Result<Identity> {
        let descriptor = self.descriptor(entity)?;
        Ok(Identity::new(Arc::clone(descriptor.name_arc()), key))
    }

    pub fn summary(&self) -> EngineSummary {
        EngineSummary {
            entities: self
                .registry
                .entities()
                .map(|d| d.name().to_string())
                .collect(),
            cached: self
                .registry
                .entities()
                .filter_map(|d| {
                    d.cache().map(|c| {
                        (
                            d.name().to_string(),
                            c.region.clone(),
                            c.strategy.to_string(),
                        )
                    })
                })
                .collect(),
            second_level_cache: self.cache.is_some(),
            session: self.config.clone(),
        }
    }

    /// [`summary`](Self::summary) as pretty-printed JSON.
    pub fn summary_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.summary())?)
    }
}

// ============================================================================
// Builder
// ============================================================================

enum CacheSetup {
    None,
    InMemory(CacheConfig),
    Provider(Box<dyn FnOnce() -> SecondLevelCache>),
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    registry: Option<Result<Registry>>,
    cache: CacheSetup,
    config: SessionConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = match &self.cache {
            CacheSetup::None => "none",
            CacheSetup::InMemory(_) => "in-memory",
            CacheSetup::Provider(_) => "provider",
        };
        f.debug_struct("EngineBuilder")
            .field("registry", &self.registry.is_some())
            .field("cache", &cache)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// Create a new engine builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: None,
            cache: CacheSetup::None,
            config: SessionConfig::default(),
        }
    }

    /// Use an already built registry.
    #[must_use]
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(Ok(registry));
        self
    }

    /// Load the registry from a metadata source.
    #[must_use]
    pub fn metadata(mut self, source: impl MetadataSource) -> Self {
        self.registry = Some(source.load());
        self
    }

    /// Use an in-memory second-level cache.
    #[must_use]
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = CacheSetup::InMemory(config);
        self
    }

    /// Use a second-level cache backed by `provider`.
    #[must_use]
    pub fn cache_provider(mut self, provider: impl CacheProvider + 'static) -> Self {
        self.cache = CacheSetup::Provider(Box::new(move || SecondLevelCache::new(provider)));
        self
    }

    /// Default configuration of sessions opened from the engine.
    #[must_use]
    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let registry = self
            .registry
            .ok_or_else(|| Error::metadata(None, "no registry or metadata source configured"))??;

        let cache = match self.cache {
            CacheSetup::None => None,
            CacheSetup::InMemory(config) => Some(Arc::new(SecondLevelCache::in_memory(config))),
            CacheSetup::Provider(make) => Some(Arc::new(make())),
        };

        let cached = registry.entities().filter(|d| d.cache().is_some()).count();
        if cache.is_none() && cached > 0 {
            tracing::warn!(
                cached,
                "Entity types declare cache regions but no second-level cache is configured; ignoring"
            );
        }
        if cache.is_some() && !self.config.use_second_level_cache {
            tracing::warn!(
                "Second-level cache configured but disabled in the session configuration"
            );
        }

        tracing::info!(
            entities = registry.len(),
            cached,
            second_level_cache = cache.is_some(),
            "Engine built"
        );

        Ok(Engine {
            registry: Arc::new(registry),
            cache,
            config: self.config,
        })
    }
}
