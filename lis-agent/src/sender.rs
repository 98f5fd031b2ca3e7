//! 结果上报
//!
//! 规范化结果打包成与中心约定的JSON载荷，HTTP POST上报。
//! 网络失败、非2xx、应答不是JSON、success=false 都算发送失败，
//! 由调用方决定是否入本地队列。

use crate::config::AgentEquipment;
use lis_core::models::{IngestResponse, NormalizedResult, PayloadValue, ResultPayload};
use lis_core::{LisError, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// 上报超时，超过即视为失败而不是挂起
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP结果上报器
pub struct ResultSender {
    client: reqwest::Client,
    endpoint: String,
}

impl ResultSender {
    pub fn new(endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| LisError::Internal(format!("HTTP客户端构建失败: {}", e)))?;
        Ok(Self { client, endpoint })
    }

    /// 上报一条结果，只有确认 success=true 才算送达
    pub async fn send(&self, payload: &ResultPayload) -> Result<IngestResponse> {
        debug!("POST {} equipo={}", self.endpoint, payload.equipment_name);

        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| LisError::Delivery(format!("请求失败: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LisError::Delivery(format!("服务端返回 {}", status)));
        }

        let reply: IngestResponse = response
            .json()
            .await
            .map_err(|e| LisError::Delivery(format!("应答不是有效JSON: {}", e)))?;

        if !reply.success {
            return Err(LisError::Delivery(
                reply
                    .message
                    .unwrap_or_else(|| "服务端拒绝结果".to_string()),
            ));
        }
        Ok(reply)
    }
}

/// 把本地规范化结果打包成上报载荷
pub fn build_payload(
    station_name: &str,
    equipment: &AgentEquipment,
    normalized: &NormalizedResult,
) -> ResultPayload {
    let valores: BTreeMap<String, PayloadValue> = normalized
        .values
        .iter()
        .map(|v| {
            (
                v.parameter.clone(),
                PayloadValue {
                    valor: v.value.clone(),
                    unidad: v.unit.clone(),
                    referencia: v.reference_range.clone(),
                    estado: v.flag,
                },
            )
        })
        .collect();

    let equipment_type = format!("{:?}", equipment.kind).to_lowercase();
    ResultPayload {
        station_name: station_name.to_string(),
        equipment_type: equipment_type.clone(),
        equipment_name: equipment.name.clone(),
        cedula: normalized.raw_identifier.clone(),
        paciente_id: None,
        tipo_estudio: equipment
            .tipo_estudio
            .clone()
            .unwrap_or(equipment_type),
        valores,
        timestamp: normalized.received_at,
    }
}

/// `--test` 模式的合成血常规载荷
pub fn test_payload(station_name: &str) -> ResultPayload {
    let mut valores = BTreeMap::new();
    for (code, valor, unidad, referencia) in [
        ("WBC", "7.5", "10^3/uL", "4.0-10.0"),
        ("RBC", "4.8", "10^6/uL", "4.2-5.9"),
        ("HGB", "14.2", "g/dL", "12.0-16.0"),
        ("PLT", "285", "10^3/uL", "150-400"),
    ] {
        valores.insert(
            code.to_string(),
            PayloadValue {
                valor: valor.to_string(),
                unidad: unidad.to_string(),
                referencia: referencia.to_string(),
                estado: Default::default(),
            },
        );
    }

    ResultPayload {
        station_name: station_name.to_string(),
        equipment_type: "hematologia".to_string(),
        equipment_name: "EQUIPO_PRUEBA".to_string(),
        cedula: Some("00000000000".to_string()),
        paciente_id: None,
        tipo_estudio: "Hemograma".to_string(),
        valores,
        timestamp: chrono::Utc::now(),
    }
}
