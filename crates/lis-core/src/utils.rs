//! 通用工具函数

use crate::models::NormalizedValue;
use chrono::{DateTime, Timelike, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 计算结果幂等键
///
/// 键 = SHA-256(设备ID | 原始标识 | 接收时间截断到分钟 | 有序参数值对)。
/// 同一物理消息在一分钟窗口内的重复投递落在同一个键上。
pub fn idempotency_key(
    equipment_id: Uuid,
    raw_identifier: Option<&str>,
    received_at: DateTime<Utc>,
    values: &[NormalizedValue],
) -> String {
    let minute = received_at
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(received_at);

    let mut hasher = Sha256::new();
    hasher.update(equipment_id.as_bytes());
    hasher.update(b"|");
    hasher.update(raw_identifier.unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(minute.to_rfc3339().as_bytes());
    for v in values {
        hasher.update(b"|");
        hasher.update(v.parameter.as_bytes());
        hasher.update(b"=");
        hasher.update(v.value.as_bytes());
    }

    format!("{:x}", hasher.finalize())
}

/// 生成样本编号
///
/// 检验科带 L 前缀（L1, L2, ...），其他科室为纯序号。
pub fn format_sample_code(sequence: u64, is_lab: bool) -> String {
    if is_lab {
        format!("L{}", sequence)
    } else {
        format!("{}", sequence)
    }
}

/// HL7时间戳格式: YYYYMMDDHHMMSS
pub fn hl7_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AbnormalFlag;
    use chrono::TimeZone;

    fn value(parameter: &str, value: &str) -> NormalizedValue {
        NormalizedValue {
            parameter: parameter.to_string(),
            value: value.to_string(),
            unit: String::new(),
            reference_range: String::new(),
            flag: AbnormalFlag::Normal,
        }
    }

    #[test]
    fn test_idempotency_key_stable_within_minute() {
        let equipment = Uuid::new_v4();
        let values = vec![value("WBC", "7.5"), value("HGB", "14.2")];

        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 5).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 48).unwrap();

        // 同一分钟内重传 → 同一个键
        let k1 = idempotency_key(equipment, Some("12345"), t1, &values);
        let k2 = idempotency_key(equipment, Some("12345"), t2, &values);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_idempotency_key_differs_across_inputs() {
        let equipment = Uuid::new_v4();
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 5).unwrap();
        let values = vec![value("WBC", "7.5")];

        let base = idempotency_key(equipment, Some("12345"), t, &values);

        let other_minute = Utc.with_ymd_and_hms(2024, 3, 1, 10, 31, 5).unwrap();
        assert_ne!(base, idempotency_key(equipment, Some("12345"), other_minute, &values));
        assert_ne!(base, idempotency_key(equipment, Some("54321"), t, &values));
        assert_ne!(base, idempotency_key(Uuid::new_v4(), Some("12345"), t, &values));

        let changed = vec![value("WBC", "9.9")];
        assert_ne!(base, idempotency_key(equipment, Some("12345"), t, &changed));
    }

    #[test]
    fn test_format_sample_code() {
        assert_eq!(format_sample_code(1, true), "L1");
        assert_eq!(format_sample_code(42, false), "42");
    }

    #[test]
    fn test_hl7_timestamp() {
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 5).unwrap();
        assert_eq!(hl7_timestamp(t), "20240301103005");
    }
}
