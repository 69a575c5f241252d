//! 基础设施层 - 技术实现
//!
//! 配置加载与日志初始化

pub mod config;
pub mod logging;

pub use config::{AnalysisConfig, LoggingConfig, PipelineConfig, StorageConfig, StoreConfig};
pub use logging::init_logging;
