//! 工作订单编码
//!
//! 向双向设备下发检验订单: ASTM 为 H/P/O/L 记录序列，
//! HL7 为 MSH/PID/OBR 段序列 (ORM^O01)。

use chrono::Utc;
use lis_core::utils::hl7_timestamp;

/// 单项检验请求
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub code: String,
    pub name: String,
}

/// 下发给设备的工作订单
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub order_id: String,
    pub patient_id: String,
    pub patient_name: String,
    pub tests: Vec<TestRequest>,
}

/// 按ASTM格式编码工作订单
pub fn build_astm_order(order: &WorkOrder) -> String {
    let mut lines = vec![
        format!(
            "H|\\^&|||Centro Diagnóstico|||||||P|1|{}",
            Utc::now().to_rfc3339()
        ),
        format!("P|1|{}||{}", order.patient_id, order.patient_name),
    ];

    for (i, test) in order.tests.iter().enumerate() {
        lines.push(format!("O|{}|{}||^^^{}|R", i + 1, order.order_id, test.code));
    }

    lines.push("L|1|N".to_string());
    lines.join("\n")
}

/// 按HL7 ORM^O01格式编码工作订单
pub fn build_hl7_order(order: &WorkOrder, equipment_name: &str) -> String {
    let timestamp = hl7_timestamp(Utc::now());
    let mut segments = vec![
        format!(
            "MSH|^~\\&|CENTRO_DIAG|LAB|{}|LAB|{}||ORM^O01|{}|P|2.3",
            equipment_name,
            timestamp,
            Utc::now().timestamp_millis()
        ),
        format!("PID|1||{}||{}", order.patient_id, order.patient_name),
    ];

    for (i, test) in order.tests.iter().enumerate() {
        segments.push(format!(
            "OBR|{}|{}||{}^{}|||{}",
            i + 1,
            order.order_id,
            test.code,
            test.name,
            timestamp
        ));
    }

    segments.join("\r")
}
