//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// 检验设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentKind {
    Hematologia,  // 血液学
    Quimica,      // 生化
    Orina,        // 尿液
    Coagulacion,  // 凝血
    Inmunologia,  // 免疫
    Microbiologia, // 微生物
    Radiografia,  // 放射
    Otro,
}

impl EquipmentKind {
    /// 该设备类型产出的结果是否属于检验科（影响样本编号前缀）
    pub fn is_lab(&self) -> bool {
        !matches!(self, EquipmentKind::Radiografia | EquipmentKind::Otro)
    }
}

/// 设备通信协议
///
/// 在监听器构造时一次性选定，之后不再按消息重新分发。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Astm,
    Hl7,
    Tcp,
    Serial,
    File,
}

/// 串口校验位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// 设备传输配置
///
/// 各字段按协议取用: TCP/HL7 使用 host/port，SERIAL 使用 serial_* 字段，
/// FILE 使用 watch_dir/pattern。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    // TCP服务端
    #[serde(default = "default_host")]
    pub host: String,
    pub port: Option<u16>,

    // 串口
    pub serial_path: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,

    // 目录轮询
    pub watch_dir: Option<PathBuf>,
    pub pattern: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    // 通用
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_poll_interval() -> u64 {
    10
}
fn default_io_timeout() -> u64 {
    10
}
fn default_reconnect_delay() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            serial_path: None,
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
            watch_dir: None,
            pattern: None,
            poll_interval_secs: default_poll_interval(),
            io_timeout_secs: default_io_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

/// 参数映射表条目（设备代码 → 系统参数）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMapping {
    pub equipment_code: String,
    pub parameter_name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub reference_range: Option<String>,
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    #[serde(default = "default_decimals")]
    pub decimals: u8,
}

fn default_scale_factor() -> f64 {
    1.0
}
fn default_decimals() -> u8 {
    2
}

/// 检查项目映射条目（设备默认挂靠的检查项目）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyMapping {
    pub equipment_code: Option<String>,
    pub study_id: Uuid,
    pub study_name: String,
}

/// 设备生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EquipmentState {
    Activo,
    Inactivo,
    Mantenimiento,
    Error,
}

/// 设备运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EquipmentStats {
    pub results_received: u64,
    pub errors: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_result: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// 检验/影像设备
///
/// 由管理员创建，管道在每次接收尝试后更新统计；只停用，不删除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equipment {
    pub id: Uuid,
    pub name: String,
    pub brand: String,
    pub model: String,
    pub kind: EquipmentKind,
    pub protocol: Protocol,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub parameter_map: Vec<ParameterMapping>,
    #[serde(default)]
    pub study_map: Vec<StudyMapping>,
    pub state: EquipmentState,
    #[serde(default)]
    pub stats: EquipmentStats,
}

impl Equipment {
    /// 查找设备代码对应的参数映射
    pub fn mapping_for(&self, equipment_code: &str) -> Option<&ParameterMapping> {
        self.parameter_map
            .iter()
            .find(|m| m.equipment_code == equipment_code)
    }

    /// 默认检查项目（映射表第一项）
    pub fn default_study(&self) -> Option<&StudyMapping> {
        self.study_map.first()
    }
}

/// 异常标志，规范化为四档
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbnormalFlag {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "alto")]
    High,
    #[serde(rename = "bajo")]
    Low,
    #[serde(rename = "critico")]
    Critical,
}

impl Default for AbnormalFlag {
    fn default() -> Self {
        AbnormalFlag::Normal
    }
}

/// 解码后的单个观测值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    pub code: String,
    pub value: String,
    pub unit: String,
    #[serde(default)]
    pub reference_range: String,
    #[serde(default)]
    pub flag: AbnormalFlag,
}

/// 协议中立的解码结果
///
/// ASTM 与 HL7 解码器统一产出这一形态。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodedMessage {
    /// 消息携带的原始患者/样本标识（P记录或PID段）
    pub raw_identifier: Option<String>,
    pub values: Vec<DecodedValue>,
}

impl DecodedMessage {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// 参数映射后的单个观测值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedValue {
    pub parameter: String,
    pub value: String,
    pub unit: String,
    pub reference_range: String,
    pub flag: AbnormalFlag,
}

/// 参数映射后的完整结果，等待标识解析
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub equipment_id: Uuid,
    pub raw_identifier: Option<String>,
    pub values: Vec<NormalizedValue>,
    pub received_at: DateTime<Utc>,
}

/// 标识解析结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub study_id: Option<Uuid>,
}

/// 重试队列条目
///
/// 必须持久化，等待对应的管理记录补录后重新解析。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingEntry {
    pub equipment_id: Uuid,
    pub raw_identifier: String,
    pub values: Vec<NormalizedValue>,
    pub received_at: DateTime<Utc>,
}

impl PendingEntry {
    /// 队列键: 设备 + 原始标识
    pub fn key(&self) -> String {
        format!("{}-{}", self.equipment_id, self.raw_identifier)
    }
}

/// 结果生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    #[serde(rename = "pendiente")]
    Pending,
    #[serde(rename = "en_proceso")]
    InProgress,
    #[serde(rename = "completado")]
    Completed,
    #[serde(rename = "entregado")]
    Delivered,
    #[serde(rename = "anulado")]
    Void,
}

/// 已持久化的最终结果记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedResult {
    pub id: Uuid,
    /// 全局唯一、可读的样本编号（检验科带 L 前缀）
    pub sample_code: String,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
    pub invoice_id: Option<Uuid>,
    pub study_id: Option<Uuid>,
    pub values: Vec<NormalizedValue>,
    pub status: ResultStatus,
    pub notes: String,
    /// 幂等键，重复帧投递时用于去重
    pub idempotency_key: String,
    pub performed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// 代理上报的单个参数值（线上格式，字段名保持西文兼容）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadValue {
    pub valor: String,
    #[serde(default)]
    pub unidad: String,
    #[serde(default)]
    pub referencia: String,
    #[serde(default)]
    pub estado: AbnormalFlag,
}

/// 代理 → 中心的结果上报载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPayload {
    pub station_name: String,
    pub equipment_type: String,
    pub equipment_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cedula: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paciente_id: Option<String>,
    pub tipo_estudio: String,
    /// BTreeMap 保证参数序稳定，幂等键依赖于此
    pub valores: BTreeMap<String, PayloadValue>,
    pub timestamp: DateTime<Utc>,
}

impl ResultPayload {
    /// 取患者标识: cedula 优先，其次 paciente_id
    pub fn identifier(&self) -> Option<&str> {
        self.cedula
            .as_deref()
            .or(self.paciente_id.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// 中心接收端点的应答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub success: bool,
    #[serde(rename = "codigoMuestra", default, skip_serializing_if = "Option::is_none")]
    pub codigo_muestra: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 代理本地队列条目（发送失败时落盘，确认送达后才移除）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentQueueEntry {
    pub equipment_name: String,
    pub payload: ResultPayload,
    pub queued_at: DateTime<Utc>,
}
