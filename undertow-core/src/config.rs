//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

use crate::UndertowError;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub cache: CacheConfig,
    pub swarm: SwarmConfig,
}

/// Piece cache configuration.
///
/// Controls how much torrent data may be held at once, where it lives and how
/// the capacity is split between concurrent readers.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache capacity in bytes per torrent (0 = derive from piece length and readahead)
    pub cache_size: u64,
    /// Store pieces as files under `save_path` instead of memory buffers
    pub use_disk: bool,
    /// Root directory for disk-backed pieces
    pub save_path: PathBuf,
    /// Delete the torrent's piece directory when its cache closes
    pub remove_cache_on_drop: bool,
    /// Share of a reader's window placed ahead of its position (0-100)
    pub reader_readahead_percent: u64,
    /// Share of the cache size warmed by preload (0-100)
    pub preload_percent: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 64 << 20, // 64 MiB
            use_disk: false,
            save_path: std::env::temp_dir().join("undertow"),
            remove_cache_on_drop: false,
            reader_readahead_percent: 95,
            preload_percent: 50,
        }
    }
}

/// Swarm interaction and torrent lifecycle configuration.
///
/// Controls connection budgeting, timeouts and the fixed readahead pushed to
/// every cache.
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Established connections per torrent; split between active readers
    pub connections_limit: usize,
    /// How long a torrent lingers after its last reader closes
    pub disconnect_timeout: Duration,
    /// Watchdog for metadata retrieval
    pub metadata_timeout: Duration,
    /// Inactivity after which a reader goes idle when others share the cache
    pub reader_idle_timeout: Duration,
    /// Interval of the per-torrent progress ticker
    pub progress_interval: Duration,
    /// Readahead pushed to caches on every tick
    pub fixed_readahead: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            connections_limit: 25,
            disconnect_timeout: Duration::from_secs(30),
            metadata_timeout: Duration::from_secs(300), // 5 minutes
            reader_idle_timeout: Duration::from_secs(60),
            progress_interval: Duration::from_secs(1),
            fixed_readahead: 16 << 20, // 16 MiB
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(size) = std::env::var("UNDERTOW_CACHE_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                config.cache.cache_size = bytes;
            }
        }

        if let Ok(use_disk) = std::env::var("UNDERTOW_USE_DISK") {
            config.cache.use_disk = use_disk.parse().unwrap_or(false);
        }

        if let Ok(path) = std::env::var("UNDERTOW_SAVE_PATH") {
            if !path.is_empty() {
                config.cache.save_path = PathBuf::from(path);
            }
        }

        if let Ok(remove) = std::env::var("UNDERTOW_REMOVE_CACHE_ON_DROP") {
            config.cache.remove_cache_on_drop = remove.parse().unwrap_or(false);
        }

        if let Ok(percent) = std::env::var("UNDERTOW_READAHEAD_PERCENT") {
            if let Ok(value) = percent.parse::<u64>() {
                config.cache.reader_readahead_percent = value.clamp(5, 100);
            }
        }

        if let Ok(percent) = std::env::var("UNDERTOW_PRELOAD_PERCENT") {
            if let Ok(value) = percent.parse::<u64>() {
                config.cache.preload_percent = value.min(100);
            }
        }

        if let Ok(limit) = std::env::var("UNDERTOW_CONNECTIONS_LIMIT") {
            if let Ok(count) = limit.parse::<usize>() {
                config.swarm.connections_limit = count;
            }
        }

        if let Ok(timeout) = std::env::var("UNDERTOW_DISCONNECT_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.swarm.disconnect_timeout = Duration::from_secs(seconds);
            }
        }

        config
    }

    /// Rejects settings the cache cannot work with.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - A percentage is out of range, a
    ///   budget is zero or disk mode has no save path
    pub fn validate(&self) -> Result<(), UndertowError> {
        let fail = |reason: &str| {
            Err(UndertowError::Configuration {
                reason: reason.to_string(),
            })
        };
        if !(5..=100).contains(&self.cache.reader_readahead_percent) {
            return fail("reader readahead percent must be between 5 and 100");
        }
        if self.cache.preload_percent > 100 {
            return fail("preload percent must not exceed 100");
        }
        if self.cache.use_disk && self.cache.save_path.as_os_str().is_empty() {
            return fail("disk cache needs a save path");
        }
        if self.swarm.connections_limit == 0 {
            return fail("connections limit must be positive");
        }
        if self.swarm.fixed_readahead == 0 {
            return fail("fixed readahead must be positive");
        }
        Ok(())
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timers so lifecycle tests finish quickly.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                cache_size: 4 << 20,
                ..Default::default()
            },
            swarm: SwarmConfig {
                disconnect_timeout: Duration::from_millis(100),
                metadata_timeout: Duration::from_millis(500),
                progress_interval: Duration::from_millis(50),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = UndertowConfig::default();

        assert_eq!(config.cache.cache_size, 64 << 20);
        assert!(!config.cache.use_disk);
        assert_eq!(config.cache.reader_readahead_percent, 95);
        assert_eq!(config.swarm.connections_limit, 25);
        assert_eq!(config.swarm.metadata_timeout, Duration::from_secs(300));
        assert_eq!(config.swarm.reader_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.swarm.fixed_readahead, 16 << 20);
    }

    #[test]
    fn test_testing_preset() {
        let config = UndertowConfig::for_testing();
        assert_eq!(config.cache.cache_size, 4 << 20);
        assert!(config.swarm.metadata_timeout < Duration::from_secs(1));
    }

    #[test]
    fn test_validate_accepts_presets() {
        UndertowConfig::default().validate().unwrap();
        UndertowConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let mut config = UndertowConfig::default();
        config.cache.preload_percent = 150;
        assert!(matches!(
            config.validate(),
            Err(UndertowError::Configuration { .. })
        ));

        let mut config = UndertowConfig::default();
        config.swarm.connections_limit = 0;
        let err = config.validate().unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().contains("connections limit"));

        let mut config = UndertowConfig::default();
        config.cache.use_disk = true;
        config.cache.save_path = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("UNDERTOW_CACHE_SIZE", "1048576");
            std::env::set_var("UNDERTOW_USE_DISK", "true");
            std::env::set_var("UNDERTOW_READAHEAD_PERCENT", "200");
            std::env::set_var("UNDERTOW_CONNECTIONS_LIMIT", "40");
            std::env::set_var("UNDERTOW_DISCONNECT_TIMEOUT", "5");
        }

        let config = UndertowConfig::from_env();

        assert_eq!(config.cache.cache_size, 1 << 20);
        assert!(config.cache.use_disk);
        assert_eq!(config.cache.reader_readahead_percent, 100);
        assert_eq!(config.swarm.connections_limit, 40);
        assert_eq!(config.swarm.disconnect_timeout, Duration::from_secs(5));

        // Cleanup
        unsafe {
            std::env::remove_var("UNDERTOW_CACHE_SIZE");
            std::env::remove_var("UNDERTOW_USE_DISK");
            std::env::remove_var("UNDERTOW_READAHEAD_PERCENT");
            std::env::remove_var("UNDERTOW_CONNECTIONS_LIMIT");
            std::env::remove_var("UNDERTOW_DISCONNECT_TIMEOUT");
        }
    }
}
