//! 配置管理基础设施层
//!
//! 分层加载：
//! - 内置默认值
//! - 可选配置文件 (TOML / JSON)
//! - 环境变量 `ATTACHMENT_STORE__<SECTION>__<KEY>`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

use crate::error::{AppError, Result};

const ENV_PREFIX: &str = "ATTACHMENT_STORE";

/// 全局配置根结构
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct StoreConfig {
    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub pipeline: PipelineConfig,

    pub analysis: AnalysisConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub base_dir: PathBuf,

    /// Content above this many bytes is rejected before any I/O.
    #[validate(range(min = 1))]
    pub max_file_size: u64,

    /// Compressible content smaller than this is stored as-is.
    pub compression_threshold: u64,

    #[validate(range(max = 9))]
    pub compression_level: u32,

    /// Capacity of the single-writer command channel.
    #[validate(range(min = 1, max = 4096))]
    pub writer_queue_depth: usize,
}

/// 处理流水线配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    #[validate(range(min = 1, max = 10000))]
    pub batch_size: usize,

    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent_operations: usize,

    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent_parents: usize,
}

/// 内容分析配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Glob patterns such as `image/*`; empty accepts every type.
    pub allowed_mime_types: Vec<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    #[validate(length(min = 1, max = 100))]
    pub level: String,

    pub json: bool,

    /// Daily-rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./data/attachments"),
            max_file_size: 100 * 1024 * 1024, // 100MB
            compression_threshold: 1024,
            compression_level: 6,
            writer_queue_depth: 64,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrent_operations: num_cpus::get().max(1),
            max_concurrent_parents: 4,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl StoreConfig {
    /// Defaults rooted at `base_dir`; mostly useful for embedding and tests.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.base_dir = base_dir.into();
        config
    }

    /// Load configuration: defaults, then `path` (if given), then environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&StoreConfig::default()).map_err(config_error)?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            if !path.exists() {
                return Err(AppError::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let loaded: StoreConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(config_error)?;

        loaded.check()?;
        Ok(loaded)
    }

    /// Run the declarative validation rules.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AppError::Serialization(e.to_string()))
    }
}

fn config_error(error: config::ConfigError) -> AppError {
    AppError::Config(error.to_string())
}
