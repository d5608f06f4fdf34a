//! Second-level cache configuration.

use std::collections::HashMap;

/// Per-region settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionConfig {
    /// Maximum number of items; least-recently-used items are evicted beyond it.
    /// `None` means unbounded.
    pub capacity: Option<usize>,
}

impl RegionConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
        }
    }
}

/// Configuration for the in-memory cache provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Applied to regions without an explicit entry.
    pub default_region: RegionConfig,
    pub regions: HashMap<String, RegionConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_region: RegionConfig {
                capacity: Some(10_000),
            },
            regions: HashMap::new(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration of one region (builder pattern).
    #[must_use]
    pub fn region(mut self, name: impl Into<String>, config: RegionConfig) -> Self {
        self.regions.insert(name.into(), config);
        self
    }

    /// Set the default region configuration (builder pattern).
    #[must_use]
    pub fn default_region(mut self, config: RegionConfig) -> Self {
        self.default_region = config;
        self
    }

    pub fn region_config(&self, name: &str) -> &RegionConfig {
        self.regions.get(name).unwrap_or(&self.default_region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_lookup_falls_back_to_default() {
        let config = CacheConfig::new()
            .default_region(RegionConfig::with_capacity(5))
            .region("orders", RegionConfig::with_capacity(2));
        assert_eq!(config.region_config("orders").capacity, Some(2));
        assert_eq!(config.region_config("other").capacity, Some(5));
    }
}
