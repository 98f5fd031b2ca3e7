//! 服务器配置

use config::{Config, Environment, File};
use lis_core::models::Equipment;
use lis_core::{LisError, Result};
use lis_pipeline::ResolverConfig;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

/// 服务器配置
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// HTTP监听地址
    #[serde(default = "default_http_addr")]
    pub http_addr: String,

    /// 重试队列落盘路径
    #[serde(default = "default_queue_path")]
    pub retry_queue_path: PathBuf,

    /// 重试队列重放间隔（秒）
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// 分支名，启用时样本序列按分支隔离
    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub resolver: ResolverConfig,

    /// 设备注册表
    #[serde(default)]
    pub equipment: Vec<Equipment>,
}

fn default_http_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_queue_path() -> PathBuf {
    PathBuf::from("./data/cola_pendiente.json")
}
fn default_retry_interval() -> u64 {
    60
}

impl Settings {
    /// 从配置文件加载，环境变量（LIS_ 前缀）可覆盖
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("LIS").separator("_"))
            .build()
            .map_err(|e| LisError::Config(e.to_string()))?;

        let settings: Settings = settings
            .try_deserialize()
            .map_err(|e| LisError::Config(format!("配置反序列化失败: {}", e)))?;

        info!(
            "配置加载成功: {} ({} 台设备)",
            config_path,
            settings.equipment.len()
        );
        Ok(settings)
    }
}
