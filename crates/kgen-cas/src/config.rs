//! CAS configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `KGEN_CAS_PATH`: Base path for CAS storage
//! - `KGEN_CAS_READONLY`: Set to "true" for read-only mode
//! - `KGEN_CAS_CHUNK_SIZE`: Fixed chunk size (and threshold) in bytes
//!
//! Default path: `~/.kgen/cas`

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::chunker::ChunkingConfig;

pub const ENV_PATH: &str = "KGEN_CAS_PATH";
pub const ENV_READONLY: &str = "KGEN_CAS_READONLY";
pub const ENV_CHUNK_SIZE: &str = "KGEN_CAS_CHUNK_SIZE";

/// Configuration for the content-addressed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasConfig {
    /// Base path for CAS storage.
    /// Blobs live in `{base_path}/objects/`, manifests in `{base_path}/manifests/`.
    pub base_path: PathBuf,

    /// Read-only mode - every mutation fails with `ReadOnly`.
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub chunking: ChunkingConfig,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            base_path: default_cas_path(),
            read_only: false,
            chunking: ChunkingConfig::default(),
        }
    }
}

/// Get the default CAS path (~/.kgen/cas).
fn default_cas_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".kgen").join("cas"))
        .unwrap_or_else(|| PathBuf::from(".kgen/cas"))
}

fn parse_flag(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "true" || value == "1" || value == "yes"
}

impl CasConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_path = lookup(ENV_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(default_cas_path);

        let read_only = lookup(ENV_READONLY)
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let chunking = match lookup(ENV_CHUNK_SIZE) {
            Some(raw) => {
                let size: usize = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{} is not a byte count: {:?}", ENV_CHUNK_SIZE, raw))?;
                anyhow::ensure!(size > 0, "{} must be greater than zero", ENV_CHUNK_SIZE);
                ChunkingConfig::fixed(size)
            }
            None => ChunkingConfig::default(),
        };

        Ok(Self {
            base_path,
            read_only,
            chunking,
        })
    }

    /// Load configuration from a TOML file, falling back to environment.
    ///
    /// The file should contain a `[cas]` section:
    /// ```toml
    /// [cas]
    /// base_path = "/srv/kgen/cas"
    /// read_only = false
    ///
    /// [cas.chunking]
    /// strategy = "content_defined"
    /// chunk_size = 1048576
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        match table.get("cas") {
            Some(cas) => {
                let config: CasConfig = cas
                    .clone()
                    .try_into()
                    .with_context(|| format!("invalid [cas] section in {}", path.display()))?;
                config.validate()?;
                Ok(config)
            }
            None => Self::from_env(),
        }
    }

    /// Create a config with a specific base path.
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            read_only: false,
            chunking: ChunkingConfig::default(),
        }
    }

    /// Create a read-only config with a specific base path.
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::with_base_path(path)
        }
    }

    /// Builder: replace the chunking parameters.
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        anyhow::ensure!(c.chunk_size > 0, "chunking.chunk_size must be greater than zero");
        anyhow::ensure!(
            c.min_size <= c.max_size,
            "chunking.min_size ({}) exceeds chunking.max_size ({})",
            c.min_size,
            c.max_size
        );
        Ok(())
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.base_path.join("objects")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.base_path.join("manifests")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.base_path.join("refs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join("staging")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.base_path.join("quarantine")
    }

    /// Lock file held by the one writable handle on this store.
    pub fn lock_path(&self) -> PathBuf {
        self.base_path.join("LOCK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkingStrategy;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = CasConfig::default();
        assert!(config.base_path.to_string_lossy().contains(".kgen"));
        assert!(!config.read_only);
        assert_eq!(config.chunking.strategy, ChunkingStrategy::Fixed);
        assert_eq!(config.chunking.chunk_size, 1024 * 1024);
    }

    #[test]
    fn test_read_only_config() {
        let config = CasConfig::read_only("/srv/cas");
        assert_eq!(config.base_path, PathBuf::from("/srv/cas"));
        assert!(config.read_only);
    }

    #[test]
    fn test_directory_layout() {
        let config = CasConfig::with_base_path("/test/cas");
        assert_eq!(config.objects_dir(), PathBuf::from("/test/cas/objects"));
        assert_eq!(config.manifests_dir(), PathBuf::from("/test/cas/manifests"));
        assert_eq!(config.refs_dir(), PathBuf::from("/test/cas/refs"));
        assert_eq!(config.staging_dir(), PathBuf::from("/test/cas/staging"));
        assert_eq!(config.quarantine_dir(), PathBuf::from("/test/cas/quarantine"));
        assert_eq!(config.lock_path(), PathBuf::from("/test/cas/LOCK"));
    }

    #[test]
    fn test_lookup_overrides() -> Result<()> {
        let config = CasConfig::from_lookup(lookup(&[
            (ENV_PATH, "/data/cas"),
            (ENV_READONLY, "TRUE"),
            (ENV_CHUNK_SIZE, "65536"),
        ]))?;
        assert_eq!(config.base_path, PathBuf::from("/data/cas"));
        assert!(config.read_only);
        assert_eq!(config.chunking, ChunkingConfig::fixed(65536));
        Ok(())
    }

    #[test]
    fn test_lookup_defaults() -> Result<()> {
        let config = CasConfig::from_lookup(lookup(&[]))?;
        assert!(config.base_path.to_string_lossy().contains(".kgen"));
        assert!(!config.read_only);
        Ok(())
    }

    #[test]
    fn test_bad_chunk_size_is_rejected() {
        assert!(CasConfig::from_lookup(lookup(&[(ENV_CHUNK_SIZE, "lots")])).is_err());
        assert!(CasConfig::from_lookup(lookup(&[(ENV_CHUNK_SIZE, "0")])).is_err());
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("kgen.toml");
        std::fs::write(
            &path,
            r#"
[cas]
base_path = "/srv/kgen/cas"
read_only = true

[cas.chunking]
strategy = "content_defined"
chunk_size = 8192
"#,
        )?;

        let config = CasConfig::from_file(&path)?;
        assert_eq!(config.base_path, PathBuf::from("/srv/kgen/cas"));
        assert!(config.read_only);
        assert_eq!(config.chunking.strategy, ChunkingStrategy::ContentDefined);
        assert_eq!(config.chunking.chunk_size, 8192);
        assert_eq!(config.chunking.threshold, 1024 * 1024);
        Ok(())
    }

    #[test]
    fn test_from_file_rejects_inverted_bounds() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("kgen.toml");
        std::fs::write(
            &path,
            "[cas]\nbase_path = \"/x\"\n[cas.chunking]\nmin_size = 100\nmax_size = 10\n",
        )?;
        assert!(CasConfig::from_file(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = CasConfig::read_only("/custom/cas")
            .with_chunking(ChunkingConfig::content_defined(4096));
        let json = serde_json::to_string(&config).unwrap();
        let restored: CasConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }
}
