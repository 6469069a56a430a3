//! Service configuration loaded from the environment

use crate::compiler::SizeLimits;
use std::env;
use std::path::PathBuf;

/// Sizes are counted in decimal megabytes
pub const MB: u64 = 1_000_000;

const SCRATCH_DIR_NAME: &str = "microCdn";

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Root for per-job scratch directories
    pub scratch_root: PathBuf,
    pub limits: SizeLimits,
    pub cache_limit: u64,
    pub minifier: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3002,
            redis_url: "redis://127.0.0.1/".to_string(),
            scratch_root: env::temp_dir().join(SCRATCH_DIR_NAME),
            limits: SizeLimits::default(),
            cache_limit: 100 * MB,
            minifier: "google-closure-compiler".to_string(),
        }
    }
}

impl Config {
    /// Parse configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);

        let redis_url = env::var("REDIS_URL")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or(defaults.redis_url);

        let scratch_root = env::var("MICROCDN_TEMPDIR")
            .map(|dir| PathBuf::from(dir).join(SCRATCH_DIR_NAME))
            .unwrap_or(defaults.scratch_root);

        let limits = SizeLimits {
            upload: bytes_var("MICROCDN_UPLOAD_SIZE_LIMIT", defaults.limits.upload),
            decompressed: bytes_var(
                "MICROCDN_DECOMPRESSED_SIZE_LIMIT",
                defaults.limits.decompressed,
            ),
            minified: bytes_var("MICROCDN_MINIFIED_SIZE_LIMIT", defaults.limits.minified),
            compressed: bytes_var("MICROCDN_COMPRESSED_SIZE_LIMIT", defaults.limits.compressed),
        };

        let cache_limit = bytes_var("MICROCDN_CACHE_LIMIT", defaults.cache_limit);

        let minifier = env::var("MICROCDN_MINIFIER").unwrap_or(defaults.minifier);

        Self {
            port,
            redis_url,
            scratch_root,
            limits,
            cache_limit,
            minifier,
        }
    }
}

fn bytes_var(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 3002);
        assert_eq!(config.cache_limit, 100 * MB);
        assert_eq!(config.limits.upload, 40 * MB);
        assert_eq!(config.limits.decompressed, 30 * MB);
        assert_eq!(config.limits.minified, 10 * MB);
        assert_eq!(config.limits.compressed, 10 * MB);
        assert!(config.scratch_root.ends_with("microCdn"));
    }

    #[test]
    fn test_bytes_var_falls_back_on_garbage() {
        assert_eq!(bytes_var("MICROCDN_TEST_UNSET_VARIABLE", 7), 7);
    }
}
