//! HL7解码器
//!
//! 解析HL7 v2.x消息（Siemens、Abbott、Roche、Beckman Coulter 等），提取：
//! - PID段（患者标识）
//! - OBX段（观测结果）
//!
//! 并为有状态传输合成最小ACK应答。

use chrono::Utc;
use lis_core::models::{AbnormalFlag, DecodedMessage, DecodedValue};
use lis_core::utils::hl7_timestamp;

/// HL7解析器
#[derive(Debug)]
pub struct Hl7Parser {
    field_separator: char,
    component_separator: char,
}

impl Default for Hl7Parser {
    fn default() -> Self {
        Self {
            field_separator: '|',
            component_separator: '^',
        }
    }
}

impl Hl7Parser {
    /// 创建新的HL7解析器
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析HL7消息，段以回车分隔
    pub fn parse(&self, frame: &str) -> DecodedMessage {
        let mut message = DecodedMessage::default();

        for segment in frame.split('\r') {
            let fields: Vec<&str> = segment.split(self.field_separator).collect();

            match fields[0].trim() {
                "PID" => {
                    // PID-3: 患者标识，取第一个 ^ 子成分
                    let raw = fields.get(3).map(|s| s.trim()).unwrap_or("");
                    let id = raw
                        .split(self.component_separator)
                        .next()
                        .unwrap_or(raw)
                        .trim();
                    if !id.is_empty() {
                        message.raw_identifier = Some(id.to_string());
                    }
                }
                "OBX" => {
                    if let Some(value) = self.parse_obx(&fields) {
                        message.values.push(value);
                    }
                }
                _ => {}
            }
        }

        message
    }

    /// 解析OBX段: OBX-3 代码, OBX-5 值, OBX-6 单位, OBX-7 参考范围, OBX-8 异常标志
    fn parse_obx(&self, fields: &[&str]) -> Option<DecodedValue> {
        let raw_code = fields.get(3).map(|s| s.trim()).unwrap_or("");
        let code = raw_code
            .split(self.component_separator)
            .next()
            .unwrap_or(raw_code)
            .trim();

        let value = fields.get(5).map(|s| s.trim()).unwrap_or("");
        if code.is_empty() || value.is_empty() {
            return None;
        }

        let unit = fields.get(6).map(|s| s.trim()).unwrap_or("");
        let reference_range = fields.get(7).map(|s| s.trim()).unwrap_or("");
        let flag = match fields.get(8).map(|s| s.trim()) {
            Some("N") => AbnormalFlag::Normal,
            Some("H") | Some("HH") => AbnormalFlag::High,
            Some("L") | Some("LL") => AbnormalFlag::Low,
            _ => AbnormalFlag::Normal,
        };

        Some(DecodedValue {
            code: code.to_string(),
            value: value.to_string(),
            unit: unit.to_string(),
            reference_range: reference_range.to_string(),
            flag,
        })
    }

    /// 合成最小ACK消息
    ///
    /// 回显原消息的发送方应用/机构与消息控制ID (MSH-10)。
    /// 仅有状态传输需要回ACK，目录轮询与一次性提交不需要。
    pub fn generate_ack(&self, original: &str) -> String {
        let msh: Vec<&str> = original
            .split('\r')
            .next()
            .unwrap_or("")
            .split(self.field_separator)
            .collect();

        let control_id = msh.get(9).map(|s| s.trim()).filter(|s| !s.is_empty()).unwrap_or("0");
        let sending_app = msh.get(2).unwrap_or(&"");
        let sending_facility = msh.get(3).unwrap_or(&"");
        let timestamp = hl7_timestamp(Utc::now());

        format!(
            "MSH|^~\\&|CENTRO_DIAG|LAB|{sending_app}|{sending_facility}|{timestamp}||ACK|{control_id}|P|2.3\rMSA|AA|{control_id}\r"
        )
    }
}
