//! GC heap configuration

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Slots reserved up front in each space (default: 256)
    pub initial_space_capacity: usize,
    /// Allocations between automatic collections, 0 disables (default: 4096)
    pub collection_threshold: usize,
    /// Move surviving objects' storage during full collections (default: false)
    pub compact: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_space_capacity: 256,
            collection_threshold: 4096,
            compact: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GcConfig::default();
        assert_eq!(config.initial_space_capacity, 256);
        assert_eq!(config.collection_threshold, 4096);
        assert!(!config.compact);
    }
}
