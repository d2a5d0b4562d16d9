use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::{OutputFormat, DEFAULT_JPEG_QUALITY};
use crate::fetch::{HttpFetcher, DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_SECS, MAX_DOWNLOAD_BYTES};
use crate::fitter::DEFAULT_SEAM_BUDGET;
use crate::inference::InferenceBackend;
use crate::model_registry::DEFAULT_MODEL;
use crate::planner::{ResizeLimits, DEFAULT_MAX_RESOLUTION, DEFAULT_MAX_SIDE};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SWEETDESK_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub model: ModelConfig,
    pub limits: LimitsConfig,
    pub fit: FitConfig,
    pub output: OutputConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub backend: InferenceBackend,
    /// Explicit model file, bypassing the registry lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tile_size: Option<u32>,
    /// Expected SHA-256 of the model file; overrides the catalogue hash.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_side: u32,
    pub max_resolution: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FitConfig {
    pub seam_budget: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DownloadConfig {
    pub timeout_secs: u64,
    pub max_attempts: usize,
    pub max_bytes: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            output_dir: PathBuf::from("output"),
            trt_cache_dir: PathBuf::from("trt_cache"),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_MODEL.to_string(),
            backend: InferenceBackend::Cpu,
            file: None,
            scale: None,
            tile_size: None,
            sha256: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            max_resolution: DEFAULT_MAX_RESOLUTION,
        }
    }
}

impl From<LimitsConfig> for ResizeLimits {
    fn from(value: LimitsConfig) -> Self {
        Self {
            max_side: value.max_side,
            max_resolution: value.max_resolution,
        }
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            seam_budget: DEFAULT_SEAM_BUDGET,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_bytes: MAX_DOWNLOAD_BYTES,
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn fetcher(&self) -> HttpFetcher {
        HttpFetcher::new(self.timeout(), self.max_attempts).with_max_bytes(self.max_bytes.max(1))
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Returns a copy with every relative path joined onto `data_dir`.
    pub fn resolved_against(&self, data_dir: &Path) -> Self {
        let mut resolved = self.clone();
        resolved.paths.models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        resolved.paths.output_dir = resolve_relative_to(data_dir, &self.paths.output_dir);
        resolved.paths.trt_cache_dir = resolve_relative_to(data_dir, &self.paths.trt_cache_dir);
        resolved.model.file = self
            .model
            .file
            .as_deref()
            .map(|file| resolve_relative_to(data_dir, file));
        resolved
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. SWEETDESK_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates `data_dir` if missing and writes a default config.toml only when
/// none exists yet.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.output_dir, PathBuf::from("output"));
        assert_eq!(cfg.model.name, "realcugan-pro");
        assert_eq!(cfg.model.backend, InferenceBackend::Cpu);
        assert!(cfg.model.file.is_none());
        assert_eq!(cfg.limits.max_side, 16384);
        assert_eq!(cfg.limits.max_resolution, 16384);
        assert_eq!(cfg.fit.seam_budget, 500);
        assert_eq!(cfg.output.format, OutputFormat::Png);
        assert_eq!(cfg.output.jpeg_quality, 95);
        assert_eq!(cfg.download.timeout_secs, 30);
        assert_eq!(cfg.download.max_attempts, 3);
        assert_eq!(cfg.download.max_bytes, 256 * 1024 * 1024);
        assert!(cfg.model.sha256.is_none());
    }

    #[test]
    fn test_download_fetcher_carries_size_cap() {
        let download = DownloadConfig {
            max_bytes: 1024,
            ..DownloadConfig::default()
        };
        let fetcher = format!("{:?}", download.fetcher());
        assert!(fetcher.contains("max_bytes: 1024"), "{fetcher}");
        assert!(fetcher.contains("max_attempts: 3"), "{fetcher}");
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.model.backend = InferenceBackend::Tensorrt;
        original.model.tile_size = Some(256);
        original.output.format = OutputFormat::Jpeg;
        original.model.sha256 = Some("ab".repeat(32));
        original.download.max_bytes = 1024;

        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            "[model]\nname = \"4xLSDIR\"\nbackend = \"cuda\"\n\n[fit]\nseam_budget = 50\n",
        )
        .expect("parse partial config");

        assert_eq!(cfg.model.name, "4xLSDIR");
        assert_eq!(cfg.model.backend, InferenceBackend::Cuda);
        assert_eq!(cfg.fit.seam_budget, 50);
        assert_eq!(cfg.limits, LimitsConfig::default());
        assert_eq!(cfg.paths, PathsConfig::default());
    }

    #[test]
    fn test_load_from_nonexistent_or_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("missing.toml");
        let loaded = AppConfig::load_from_path(&path).expect("load config from nonexistent path");
        assert_eq!(loaded, AppConfig::default());

        fs::write(&path, "  \n").expect("write empty config");
        let loaded = AppConfig::load_from_path(&path).expect("load empty config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn test_load_reports_malformed_toml() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[limits\nmax_side = ").expect("write broken config");

        let err = AppConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config TOML"));
    }

    #[test]
    fn test_data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn test_data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(val) = old {
            env::set_var(ENV_DATA_DIR, val);
        }

        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn test_config_path_is_data_dir_join_config_toml() {
        let result = config_path(Path::new("/data"));
        assert_eq!(result, PathBuf::from("/data/config.toml"));
    }

    #[test]
    fn test_initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let root = temp.path().join("fresh");
        initialize_data_dir(&root).expect("initialize data dir");

        assert!(root.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&root)).expect("reload config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn test_initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("create temp dir");
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[limits]\nmax_side = 4096\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(temp.path()).expect("initialize data dir");

        let content = fs::read_to_string(&cfg_path).expect("read config");
        assert_eq!(content, custom_content);
    }

    #[test]
    fn test_resolved_against_joins_relative_paths_only() {
        let mut cfg = AppConfig::default();
        cfg.paths.output_dir = PathBuf::from("/abs/out");
        cfg.model.file = Some(PathBuf::from("custom/model.onnx"));

        let resolved = cfg.resolved_against(Path::new("/base"));
        assert_eq!(resolved.paths.models_dir, PathBuf::from("/base/models"));
        assert_eq!(resolved.paths.output_dir, PathBuf::from("/abs/out"));
        assert_eq!(resolved.paths.trt_cache_dir, PathBuf::from("/base/trt_cache"));
        assert_eq!(
            resolved.model.file,
            Some(PathBuf::from("/base/custom/model.onnx"))
        );
    }

    #[test]
    fn test_limits_convert_to_resize_limits() {
        let limits: ResizeLimits = LimitsConfig {
            max_side: 100,
            max_resolution: 50,
        }
        .into();
        assert_eq!(limits.max_side, 100);
        assert_eq!(limits.max_resolution, 50);
    }
}
