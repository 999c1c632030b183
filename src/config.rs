//! TOML configuration for parastat.
//!
//! Every section has compiled-in defaults, so a partial file (or none at all)
//! is valid. The file is looked up through `PARASTAT_CONFIG`, then
//! `./parastat.toml`; command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::accel::{BackendPreference, ManagerOptions};
use crate::ingest::DEFAULT_COLUMN;
use crate::pipeline::PipelineOptions;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PARASTAT_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG: &str = "parastat.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub reduction: ReductionConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub opencl: OpenClConfig,
}

impl PipelineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded parastat configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `PARASTAT_CONFIG` environment variable.
    /// 2. `./parastat.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PARASTAT_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(LOCAL_CONFIG);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject values no device could run with.
    ///
    /// The upper work-group bound depends on the selected device and is
    /// checked when the pipeline is built.
    pub fn validate(&self) -> Result<()> {
        if self.reduction.local_size < 2 {
            bail!(
                "reduction.local_size must be at least 2, got {}",
                self.reduction.local_size
            );
        }
        if let Some(path) = &self.input.path {
            if path.as_os_str().is_empty() {
                bail!("input.path is set but empty");
            }
        }
        Ok(())
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            backend: self.device.backend,
            platform_index: self.device.platform_index,
            device_index: self.device.device_index,
            build_options: self.opencl.build_options.clone(),
            profiling: self.opencl.profiling,
            verify: self.reduction.verify,
        }
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            local_size: self.reduction.local_size,
            compare_atomic: self.reduction.compare_atomic,
        }
    }
}

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// Backend and `(platform, device)` selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `auto`, `opencl`, `emulated`, or `scalar`.
    pub backend: BackendPreference,
    pub platform_index: usize,
    pub device_index: usize,
}

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// Work-group size; the dataset is padded to a multiple of it.
    pub local_size: usize,
    /// Also run atomic min/max and require agreement with the tree results.
    pub compare_atomic: bool,
    /// Cross-check every dispatch against the scalar reference.
    pub verify: bool,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        let pipeline = PipelineOptions::default();
        Self {
            local_size: pipeline.local_size,
            compare_atomic: pipeline.compare_atomic,
            verify: cfg!(debug_assertions),
        }
    }
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Dataset file; the positional CLI argument takes precedence.
    pub path: Option<PathBuf>,
    /// Zero-based whitespace-delimited field holding the measurement.
    pub column: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            path: None,
            column: DEFAULT_COLUMN,
        }
    }
}

// ---------------------------------------------------------------------------
// OpenCL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenClConfig {
    /// Passed verbatim to the program build, e.g. `-cl-fast-relaxed-math`.
    pub build_options: String,
    /// Enable queue profiling so stage timings report device time.
    pub profiling: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.device.backend, BackendPreference::Auto);
        assert_eq!(config.reduction.local_size, 32);
        assert_eq!(config.input.column, DEFAULT_COLUMN);
        assert!(config.input.path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[device]
backend = "emulated"
platform_index = 0

[reduction]
local_size = 10
"#
        )
        .unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.device.backend, BackendPreference::Emulated);
        assert_eq!(config.reduction.local_size, 10);
        assert!(!config.reduction.compare_atomic);
        assert_eq!(config.input.column, DEFAULT_COLUMN);
        assert_eq!(config.opencl.build_options, "");
    }

    #[test]
    fn test_opencl_backend_name() {
        let config: PipelineConfig = toml::from_str("[device]\nbackend = \"opencl\"\n").unwrap();
        assert_eq!(config.device.backend, BackendPreference::OpenCl);
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[reduction]\nlocal_size = \"wide\"").unwrap();
        let err = PipelineConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn test_validate_rejects_tiny_work_group() {
        let mut config = PipelineConfig::default();
        config.reduction.local_size = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_options_mapping() {
        let mut config = PipelineConfig::default();
        config.device.platform_index = 1;
        config.reduction.local_size = 64;
        config.reduction.compare_atomic = true;
        config.opencl.build_options = "-cl-std=CL1.2".to_string();

        let manager = config.manager_options();
        assert_eq!(manager.platform_index, 1);
        assert_eq!(manager.build_options, "-cl-std=CL1.2");

        let pipeline = config.pipeline_options();
        assert_eq!(pipeline.local_size, 64);
        assert!(pipeline.compare_atomic);
    }
}
