//! ASTM解码器
//!
//! 解析管道分隔的ASTM风格帧（Mindray BS-200 / BC-6800 等血液、生化分析仪）。
//! 记录类型由第一个管道分隔字段决定: H=传输头, P=患者, R=结果, L=传输尾。
//! 未知记录类型直接忽略，不报错。

use lis_core::models::{AbnormalFlag, DecodedMessage, DecodedValue};
use tracing::debug;

/// ASTM帧解析器
#[derive(Debug, Default)]
pub struct AstmParser;

impl AstmParser {
    pub fn new() -> Self {
        Self
    }

    /// 解析一个完整的ASTM帧
    pub fn parse(&self, frame: &str) -> DecodedMessage {
        let mut message = DecodedMessage::default();

        for line in frame.split('\n') {
            let fields: Vec<&str> = line.split('|').collect();
            let record_type = strip_control_chars(fields[0]);

            match record_type.as_str() {
                "H" => {
                    debug!("ASTM transmission header received");
                }
                "P" => {
                    // 原始患者/样本标识在第3字段；为空就留空，交给重试队列
                    if let Some(id) = fields.get(2).map(|s| s.trim()).filter(|s| !s.is_empty()) {
                        message.raw_identifier = Some(id.to_string());
                    }
                }
                "R" => {
                    if let Some(value) = parse_result_record(&fields) {
                        message.values.push(value);
                    }
                }
                "L" => {
                    debug!("ASTM end of transmission");
                }
                _ => {} // 未知记录类型忽略
            }
        }

        message
    }
}

/// 解析R记录: 测试代码|值|单位|...|异常标志
fn parse_result_record(fields: &[&str]) -> Option<DecodedValue> {
    // 测试代码: 第3字段的第4个 ^ 子字段，否则整个第3字段
    let raw_code = fields.get(2).map(|s| s.trim()).unwrap_or("");
    let code = raw_code
        .split('^')
        .nth(3)
        .filter(|s| !s.is_empty())
        .unwrap_or(raw_code);

    let value = fields.get(3).map(|s| s.trim()).unwrap_or("");
    if code.is_empty() || value.is_empty() {
        return None;
    }

    let unit = fields.get(4).map(|s| s.trim()).unwrap_or("");
    let flag = match fields.get(8).map(|s| s.trim()) {
        Some("N") => AbnormalFlag::Normal,
        Some("H") => AbnormalFlag::High,
        Some("L") => AbnormalFlag::Low,
        _ => AbnormalFlag::Normal,
    };

    Some(DecodedValue {
        code: code.to_string(),
        value: value.to_string(),
        unit: unit.to_string(),
        reference_range: String::new(),
        flag,
    })
}

/// 去掉记录类型字段里的 STX/ETX/ENQ/ACK 控制字符
fn strip_control_chars(field: &str) -> String {
    field
        .chars()
        .filter(|c| !matches!(*c, '\x02' | '\x03' | '\x05' | '\x06'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_transmission() {
        let parser = AstmParser::new();
        let frame = "H|\\^&|||Mindray^BC-6800\nP|1|00000000000\nR|1|^^^WBC|7.5|10^3/uL||||N\nL|1|N\n";

        let message = parser.parse(frame);
        assert_eq!(message.raw_identifier.as_deref(), Some("00000000000"));
        assert_eq!(message.values.len(), 1);

        let v = &message.values[0];
        assert_eq!(v.code, "WBC");
        assert_eq!(v.value, "7.5");
        assert_eq!(v.unit, "10^3/uL");
        assert_eq!(v.flag, AbnormalFlag::Normal);
    }

    #[test]
    fn test_flag_mapping() {
        let parser = AstmParser::new();
        let frame = "P|1|12345\n\
                     R|1|^^^HGB|9.1|g/dL||||L\n\
                     R|2|^^^WBC|15.2|10^3/uL||||H\n\
                     R|3|^^^PLT|250|10^3/uL||||X\n\
                     L|1|N\n";

        let message = parser.parse(frame);
        assert_eq!(message.values[0].flag, AbnormalFlag::Low);
        assert_eq!(message.values[1].flag, AbnormalFlag::High);
        // 未识别的标志回落到 normal
        assert_eq!(message.values[2].flag, AbnormalFlag::Normal);
    }

    #[test]
    fn test_code_without_caret_subfields() {
        let parser = AstmParser::new();
        let message = parser.parse("R|1|GLU|98|mg/dL||||N\n");

        assert_eq!(message.values[0].code, "GLU");
    }

    #[test]
    fn test_control_chars_stripped_from_record_type() {
        let parser = AstmParser::new();
        let message = parser.parse("\x02P|1|998877\n\x03");

        assert_eq!(message.raw_identifier.as_deref(), Some("998877"));
    }

    #[test]
    fn test_empty_patient_field_yields_no_identifier() {
        let parser = AstmParser::new();
        // 第3字段为空时不取后续字段顶替，结果进入待解析队列
        let frame = "P|1||00000000000\nR|1|^^^WBC|7.5|10^3/uL||||N\nL|1|N\n";

        let message = parser.parse(frame);
        assert!(message.raw_identifier.is_none());
        assert_eq!(message.values.len(), 1);
    }

    #[test]
    fn test_unknown_records_and_empty_values_ignored() {
        let parser = AstmParser::new();
        let frame = "Q|1|something\nR|1|^^^WBC||10^3/uL||||N\nR|2||7.5\nL|1|N\n";

        let message = parser.parse(frame);
        // 缺代码或缺值的R记录被跳过，未知记录不报错
        assert!(message.values.is_empty());
    }
}
