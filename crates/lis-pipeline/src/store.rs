//! 管理记录存储接口
//!
//! 患者/发票/检查项目由外部管理系统拥有，本子系统只读；
//! 只写入结果、最小就诊记录与设备统计。内存实现用于测试和演示装配。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lis_core::models::{EquipmentStats, PersistedResult};
use lis_core::{LisError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 患者记录（只读视图）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    /// 身份证号
    pub cedula: String,
    pub first_name: String,
    pub last_name: String,
}

impl Patient {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// 发票记录（只读视图）
///
/// short_code 是打印在样本标签上的LIS短码，操作员在分析仪上键入它。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub number: String,
    pub short_code: u32,
    pub patient_id: Uuid,
    pub visit_id: Option<Uuid>,
}

/// 检查项目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Study {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub category: String,
    pub active: bool,
}

impl Study {
    /// 是否属于检验科（决定样本编号前缀）
    pub fn is_lab(&self) -> bool {
        if self.code.to_uppercase().starts_with("LAB") {
            return true;
        }
        const LAB_CATEGORIES: [&str; 7] = [
            "hematologia",
            "quimica",
            "orina",
            "coagulacion",
            "inmunologia",
            "microbiologia",
            "laboratorio clinico",
        ];
        let category = self.category.to_lowercase();
        LAB_CATEGORIES.iter().any(|c| category.contains(c))
    }
}

/// 就诊状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitStatus {
    Programada,
    Confirmada,
    EnProceso,
    Completada,
}

/// 就诊记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub study_id: Option<Uuid>,
    pub status: VisitStatus,
    pub reason: String,
    pub date: DateTime<Utc>,
}

/// 设备统计更新
#[derive(Debug, Clone)]
pub enum StatsUpdate {
    /// 成功接收一条结果
    Received,
    /// 接收失败
    Error(String),
}

/// 管理记录存储的协作接口
#[async_trait]
pub trait AdminStore: Send + Sync {
    /// 按LIS短码查发票
    async fn find_invoice_by_short_code(&self, short_code: u32) -> Result<Option<Invoice>>;

    /// 按身份证号查患者
    async fn find_patient_by_national_id(&self, cedula: &str) -> Result<Option<Patient>>;

    /// 查患者最近一次可挂靠结果的就诊
    async fn find_recent_visit(&self, patient_id: Uuid) -> Result<Option<Visit>>;

    /// 创建最小就诊记录
    async fn create_visit(&self, visit: Visit) -> Result<Visit>;

    async fn find_study(&self, study_id: Uuid) -> Result<Option<Study>>;

    /// 任意一个启用中的检查项目（设备无默认映射时的兜底）
    async fn any_active_study(&self) -> Result<Option<Study>>;

    /// 样本编号序列，按分支隔离（未启用分支时传None）
    async fn next_sample_sequence(&self, branch: Option<&str>) -> Result<u64>;

    /// 按幂等键查已存在的结果
    async fn find_result_by_key(&self, idempotency_key: &str) -> Result<Option<PersistedResult>>;

    async fn create_result(&self, result: PersistedResult) -> Result<PersistedResult>;

    /// 更新设备健康统计（接收计数/错误计数/最后活跃时间）
    async fn update_equipment_stats(&self, equipment_id: Uuid, update: StatsUpdate) -> Result<()>;

    /// 读取设备统计
    async fn equipment_stats(&self, equipment_id: Uuid) -> Result<EquipmentStats>;
}

/// 内存实现
///
/// 测试与演示用；生产部署换成真正的管理系统适配器。
#[derive(Default)]
pub struct InMemoryAdminStore {
    patients: RwLock<Vec<Patient>>,
    invoices: RwLock<Vec<Invoice>>,
    studies: RwLock<Vec<Study>>,
    visits: RwLock<Vec<Visit>>,
    results: RwLock<Vec<PersistedResult>>,
    sequences: RwLock<HashMap<String, u64>>,
    stats: RwLock<HashMap<Uuid, EquipmentStats>>,
}

impl InMemoryAdminStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一个患者（测试装配）
    pub async fn insert_patient(&self, patient: Patient) {
        self.patients.write().await.push(patient);
    }

    /// 预置一张发票（测试装配）
    pub async fn insert_invoice(&self, invoice: Invoice) {
        self.invoices.write().await.push(invoice);
    }

    /// 预置一个检查项目（测试装配）
    pub async fn insert_study(&self, study: Study) {
        self.studies.write().await.push(study);
    }

    /// 已持久化的结果数
    pub async fn result_count(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn results(&self) -> Vec<PersistedResult> {
        self.results.read().await.clone()
    }
}

#[async_trait]
impl AdminStore for InMemoryAdminStore {
    async fn find_invoice_by_short_code(&self, short_code: u32) -> Result<Option<Invoice>> {
        Ok(self
            .invoices
            .read()
            .await
            .iter()
            .find(|i| i.short_code == short_code)
            .cloned())
    }

    async fn find_patient_by_national_id(&self, cedula: &str) -> Result<Option<Patient>> {
        Ok(self
            .patients
            .read()
            .await
            .iter()
            .find(|p| p.cedula == cedula)
            .cloned())
    }

    async fn find_recent_visit(&self, patient_id: Uuid) -> Result<Option<Visit>> {
        Ok(self
            .visits
            .read()
            .await
            .iter()
            .filter(|v| v.patient_id == patient_id)
            .max_by_key(|v| v.date)
            .cloned())
    }

    async fn create_visit(&self, visit: Visit) -> Result<Visit> {
        self.visits.write().await.push(visit.clone());
        Ok(visit)
    }

    async fn find_study(&self, study_id: Uuid) -> Result<Option<Study>> {
        Ok(self
            .studies
            .read()
            .await
            .iter()
            .find(|s| s.id == study_id)
            .cloned())
    }

    async fn any_active_study(&self) -> Result<Option<Study>> {
        Ok(self.studies.read().await.iter().find(|s| s.active).cloned())
    }

    async fn next_sample_sequence(&self, branch: Option<&str>) -> Result<u64> {
        let key = match branch {
            Some(branch) => format!("resultado_id_{}", branch),
            None => "resultado_id".to_string(),
        };
        let mut sequences = self.sequences.write().await;
        let seq = sequences.entry(key).or_insert(0);
        *seq += 1;
        Ok(*seq)
    }

    async fn find_result_by_key(&self, idempotency_key: &str) -> Result<Option<PersistedResult>> {
        Ok(self
            .results
            .read()
            .await
            .iter()
            .find(|r| r.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn create_result(&self, result: PersistedResult) -> Result<PersistedResult> {
        let mut results = self.results.write().await;
        if results.iter().any(|r| r.sample_code == result.sample_code) {
            return Err(LisError::Storage(format!(
                "duplicate sample code: {}",
                result.sample_code
            )));
        }
        results.push(result.clone());
        Ok(result)
    }

    async fn update_equipment_stats(&self, equipment_id: Uuid, update: StatsUpdate) -> Result<()> {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(equipment_id).or_default();
        let now = Utc::now();

        match update {
            StatsUpdate::Received => {
                entry.results_received += 1;
                entry.last_seen = Some(now);
                entry.last_result = Some(now);
            }
            StatsUpdate::Error(message) => {
                entry.errors += 1;
                entry.last_error = Some(message);
            }
        }
        Ok(())
    }

    async fn equipment_stats(&self, equipment_id: Uuid) -> Result<EquipmentStats> {
        Ok(self
            .stats
            .read()
            .await
            .get(&equipment_id)
            .cloned()
            .unwrap_or_default())
    }
}
