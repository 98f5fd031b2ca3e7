//! 结果规范化
//!
//! 用设备的参数映射表把解码结果换算成系统参数：替换规范名称/单位、
//! 乘换算系数、按配置精度舍入。映射缺失时设备代码原样透传——
//! 结果绝不因缺少映射条目而被丢弃。

use chrono::{DateTime, Utc};
use lis_core::models::{DecodedMessage, Equipment, NormalizedResult, NormalizedValue};

/// 结果规范化器
#[derive(Debug, Default)]
pub struct ResultNormalizer;

impl ResultNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// 把解码消息映射为规范化结果
    pub fn normalize(
        &self,
        equipment: &Equipment,
        message: &DecodedMessage,
        received_at: DateTime<Utc>,
    ) -> NormalizedResult {
        let values = message
            .values
            .iter()
            .map(|v| match equipment.mapping_for(&v.code) {
                Some(mapping) => NormalizedValue {
                    parameter: mapping.parameter_name.clone(),
                    value: scale_value(&v.value, mapping.scale_factor, mapping.decimals),
                    unit: mapping.unit.clone().unwrap_or_else(|| v.unit.clone()),
                    reference_range: mapping
                        .reference_range
                        .clone()
                        .unwrap_or_else(|| v.reference_range.clone()),
                    flag: v.flag,
                },
                None => NormalizedValue {
                    parameter: v.code.clone(),
                    value: v.value.clone(),
                    unit: v.unit.clone(),
                    reference_range: v.reference_range.clone(),
                    flag: v.flag,
                },
            })
            .collect();

        NormalizedResult {
            equipment_id: equipment.id,
            raw_identifier: message.raw_identifier.clone(),
            values,
            received_at,
        }
    }
}

/// 数值按系数换算并按精度舍入；非数值原样返回
fn scale_value(raw: &str, factor: f64, decimals: u8) -> String {
    match raw.parse::<f64>() {
        Ok(n) => format!("{:.*}", decimals as usize, n * factor),
        Err(_) => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::models::{
        AbnormalFlag, DecodedValue, EquipmentKind, EquipmentState, EquipmentStats,
        ParameterMapping, Protocol, TransportConfig,
    };
    use uuid::Uuid;

    fn equipment_with_mapping() -> Equipment {
        Equipment {
            id: Uuid::new_v4(),
            name: "BC-6800".to_string(),
            brand: "Mindray".to_string(),
            model: "BC-6800".to_string(),
            kind: EquipmentKind::Hematologia,
            protocol: Protocol::Astm,
            transport: TransportConfig::default(),
            parameter_map: vec![ParameterMapping {
                equipment_code: "WBC".to_string(),
                parameter_name: "Leucocitos (WBC)".to_string(),
                unit: Some("10³/µL".to_string()),
                reference_range: Some("4.0-10.0".to_string()),
                scale_factor: 0.001,
                decimals: 1,
            }],
            study_map: vec![],
            state: EquipmentState::Activo,
            stats: EquipmentStats::default(),
        }
    }

    fn decoded(code: &str, value: &str) -> DecodedMessage {
        DecodedMessage {
            raw_identifier: Some("12345".to_string()),
            values: vec![DecodedValue {
                code: code.to_string(),
                value: value.to_string(),
                unit: "raw-unit".to_string(),
                reference_range: "raw-range".to_string(),
                flag: AbnormalFlag::High,
            }],
        }
    }

    #[test]
    fn test_mapping_substitutes_name_unit_and_scales() {
        let normalizer = ResultNormalizer::new();
        let equipment = equipment_with_mapping();

        let result = normalizer.normalize(&equipment, &decoded("WBC", "7500"), Utc::now());

        let v = &result.values[0];
        assert_eq!(v.parameter, "Leucocitos (WBC)");
        assert_eq!(v.value, "7.5"); // 7500 * 0.001, 1位小数
        assert_eq!(v.unit, "10³/µL");
        assert_eq!(v.reference_range, "4.0-10.0");
        assert_eq!(v.flag, AbnormalFlag::High);
    }

    #[test]
    fn test_unmapped_code_passes_through() {
        let normalizer = ResultNormalizer::new();
        let equipment = equipment_with_mapping();

        let result = normalizer.normalize(&equipment, &decoded("XYZ", "1.23"), Utc::now());

        let v = &result.values[0];
        assert_eq!(v.parameter, "XYZ");
        assert_eq!(v.value, "1.23");
        assert_eq!(v.unit, "raw-unit");
        assert_eq!(v.reference_range, "raw-range");
    }

    #[test]
    fn test_non_numeric_value_not_scaled() {
        let normalizer = ResultNormalizer::new();
        let equipment = equipment_with_mapping();

        let result = normalizer.normalize(&equipment, &decoded("WBC", "POSITIVO"), Utc::now());
        assert_eq!(result.values[0].value, "POSITIVO");
    }
}
