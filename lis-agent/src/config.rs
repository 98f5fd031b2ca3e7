//! 采集代理配置

use config::{Config, Environment, File};
use lis_core::models::{
    Equipment, EquipmentKind, EquipmentState, EquipmentStats, ParameterMapping, Protocol,
    TransportConfig,
};
use lis_core::{LisError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// 代理侧的设备条目
///
/// 代理不做标识解析，也不持有中心的设备ID；本地ID在启动时生成，
/// 上报只靠设备名称匹配。
#[derive(Debug, Clone, Deserialize)]
pub struct AgentEquipment {
    pub name: String,
    pub kind: EquipmentKind,
    pub protocol: Protocol,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub parameter_map: Vec<ParameterMapping>,
    /// 上报的检查类型名，缺省用设备类型
    #[serde(default)]
    pub tipo_estudio: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl AgentEquipment {
    /// 生成本地规范化用的设备记录
    pub fn to_equipment(&self) -> Equipment {
        Equipment {
            id: Uuid::new_v4(),
            name: self.name.clone(),
            brand: String::new(),
            model: String::new(),
            kind: self.kind,
            protocol: self.protocol,
            transport: self.transport.clone(),
            parameter_map: self.parameter_map.clone(),
            study_map: vec![],
            state: EquipmentState::Activo,
            stats: EquipmentStats::default(),
        }
    }
}

/// 代理配置
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// 中心服务基址，如 https://lis.example.com
    pub server_url: String,

    /// 采集站名称（随每条结果上报）
    pub station_name: String,

    /// 本地发送队列落盘路径
    #[serde(default = "default_queue_path")]
    pub queue_path: PathBuf,

    #[serde(default)]
    pub equipment: Vec<AgentEquipment>,
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("./data/cola_pendiente.json")
}

impl AgentSettings {
    /// 从配置文件加载，环境变量（AGENTE_ 前缀）可覆盖
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("AGENTE").separator("_"))
            .build()
            .map_err(|e| LisError::Config(e.to_string()))?;

        let settings: AgentSettings = settings
            .try_deserialize()
            .map_err(|e| LisError::Config(format!("配置反序列化失败: {}", e)))?;

        info!(
            "代理配置加载成功: 站点={} 设备={}",
            settings.station_name,
            settings.equipment.len()
        );
        Ok(settings)
    }

    /// 中心接收端点完整URL
    pub fn ingest_url(&self) -> String {
        format!(
            "{}/api/equipos/recibir-json",
            self.server_url.trim_end_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_url_strips_trailing_slash() {
        let settings: AgentSettings = serde_json::from_str(
            r#"{ "server_url": "https://lis.example.com/", "station_name": "norte" }"#,
        )
        .unwrap();
        assert_eq!(
            settings.ingest_url(),
            "https://lis.example.com/api/equipos/recibir-json"
        );
        assert!(settings.equipment.is_empty());
    }
}
