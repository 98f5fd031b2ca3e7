//! 通用TCP载荷解码
//!
//! 直连TCP的设备发送格式不一: 先尝试JSON（带 cedula + valores），
//! 失败后回退到ASTM管道分隔格式。

use crate::astm::AstmParser;
use lis_core::models::{AbnormalFlag, DecodedMessage, DecodedValue};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GenericPayload {
    cedula: String,
    valores: Vec<GenericValue>,
}

#[derive(Debug, Deserialize)]
struct GenericValue {
    codigo: Option<String>,
    parametro: Option<String>,
    valor: String,
    #[serde(default)]
    unidad: String,
    #[serde(default)]
    referencia: String,
    #[serde(default)]
    estado: AbnormalFlag,
}

/// 解码一段通用TCP数据
pub fn decode_tcp_payload(frame: &str) -> DecodedMessage {
    match serde_json::from_str::<GenericPayload>(frame) {
        Ok(payload) => {
            debug!("generic TCP payload decoded as JSON ({} values)", payload.valores.len());
            DecodedMessage {
                raw_identifier: Some(payload.cedula),
                values: payload
                    .valores
                    .into_iter()
                    .filter_map(|v| {
                        let code = v.codigo.or(v.parametro)?;
                        Some(DecodedValue {
                            code,
                            value: v.valor,
                            unit: v.unidad,
                            reference_range: v.referencia,
                            flag: v.estado,
                        })
                    })
                    .collect(),
            }
        }
        Err(_) => AstmParser::new().parse(frame),
    }
}
