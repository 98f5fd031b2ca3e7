//! 结果写入器
//!
//! 把规范化结果幂等地持久化为最终记录：
//! - 重复帧投递按幂等键去重，返回已有样本编号
//! - 无就诊可挂靠时补建最小就诊（设备默认检查项目，兜底任一启用项目）
//! - 每次写入成败都更新设备健康统计
//!
//! 这是管道里唯一可能丢数据的一步，保持为最后、最简单的一步。

use crate::store::{AdminStore, StatsUpdate, Study, Visit, VisitStatus};
use chrono::Utc;
use lis_core::models::{Equipment, NormalizedResult, PersistedResult, ResolvedTarget, ResultStatus};
use lis_core::utils::{format_sample_code, idempotency_key};
use lis_core::{Result, ResultEvent, ResultStateMachine};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

/// 写入结果
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub result_id: Uuid,
    pub sample_code: String,
    /// 本次投递命中幂等键，没有新建记录
    pub duplicate: bool,
}

/// 结果写入器
pub struct ResultWriter {
    store: Arc<dyn AdminStore>,
    state_machine: ResultStateMachine,
    /// 按幂等键串行化查重+插入，同一物理消息并发投递只落一条
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// 按患者的就诊补建锁，防止同一批结果并发补建出两条就诊
    visit_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// 启用分支时样本序列按分支隔离
    branch: Option<String>,
}

impl ResultWriter {
    pub fn new(store: Arc<dyn AdminStore>, branch: Option<String>) -> Self {
        Self {
            store,
            state_machine: ResultStateMachine::new(),
            write_locks: Mutex::new(HashMap::new()),
            visit_locks: Mutex::new(HashMap::new()),
            branch,
        }
    }

    /// 持久化一条已解析的结果
    pub async fn write(
        &self,
        equipment: &Equipment,
        normalized: &NormalizedResult,
        target: &ResolvedTarget,
    ) -> Result<WriteOutcome> {
        let key = idempotency_key(
            normalized.equipment_id,
            normalized.raw_identifier.as_deref(),
            normalized.received_at,
            &normalized.values,
        );

        let lock = {
            let mut locks = self.write_locks.lock().await;
            locks.entry(key.clone()).or_default().clone()
        };
        let outcome = {
            let _guard = lock.lock().await;
            self.write_locked(equipment, normalized, target, &key).await
        };
        drop(lock);
        Self::prune_lock(&self.write_locks, &key).await;
        outcome
    }

    /// 查重+插入，调用方持有该幂等键的锁
    async fn write_locked(
        &self,
        equipment: &Equipment,
        normalized: &NormalizedResult,
        target: &ResolvedTarget,
        key: &str,
    ) -> Result<WriteOutcome> {
        // 重复投递: 返回已有编号，不动统计计数
        if let Some(existing) = self.store.find_result_by_key(key).await? {
            info!(
                "duplicate delivery for {} ignored, existing sample {}",
                equipment.name, existing.sample_code
            );
            return Ok(WriteOutcome {
                result_id: existing.id,
                sample_code: existing.sample_code,
                duplicate: true,
            });
        }

        match self
            .write_new(equipment, normalized, target, key.to_string())
            .await
        {
            Ok(outcome) => {
                self.store
                    .update_equipment_stats(equipment.id, StatsUpdate::Received)
                    .await?;
                Ok(outcome)
            }
            Err(e) => {
                error!("failed to persist result from {}: {}", equipment.name, e);
                let _ = self
                    .store
                    .update_equipment_stats(equipment.id, StatsUpdate::Error(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// 没有其他等待者时回收键锁，锁表不随历史键无限增长
    async fn prune_lock<K: std::hash::Hash + Eq>(
        locks: &Mutex<HashMap<K, Arc<Mutex<()>>>>,
        key: &K,
    ) {
        let mut locks = locks.lock().await;
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
    }

    async fn write_new(
        &self,
        equipment: &Equipment,
        normalized: &NormalizedResult,
        target: &ResolvedTarget,
        key: String,
    ) -> Result<WriteOutcome> {
        let study = self.pick_study(equipment, target).await?;

        let visit_id = match target.visit_id {
            Some(visit_id) => Some(visit_id),
            None => Some(
                self.find_or_create_visit(equipment, target.patient_id, study.as_ref())
                    .await?,
            ),
        };

        let is_lab = study
            .as_ref()
            .map(|s| s.is_lab())
            .unwrap_or_else(|| equipment.kind.is_lab());
        let sequence = self.store.next_sample_sequence(self.branch.as_deref()).await?;
        let sample_code = format_sample_code(sequence, is_lab);

        let status = self
            .state_machine
            .transition(ResultStatus::Pending, ResultEvent::Started)?;

        let result = PersistedResult {
            id: Uuid::new_v4(),
            sample_code: sample_code.clone(),
            patient_id: target.patient_id,
            visit_id,
            invoice_id: target.invoice_id,
            study_id: study.as_ref().map(|s| s.id),
            values: normalized.values.clone(),
            status,
            notes: format!("Recibido automáticamente desde {}", equipment.name),
            idempotency_key: key,
            performed_at: normalized.received_at,
            created_at: Utc::now(),
        };

        let persisted = self.store.create_result(result).await?;
        info!(
            "result persisted: sample={} equipment={} values={}",
            persisted.sample_code,
            equipment.name,
            persisted.values.len()
        );

        Ok(WriteOutcome {
            result_id: persisted.id,
            sample_code: persisted.sample_code,
            duplicate: false,
        })
    }

    /// 选检查项目: 解析目标 → 设备默认映射 → 任一启用项目
    async fn pick_study(
        &self,
        equipment: &Equipment,
        target: &ResolvedTarget,
    ) -> Result<Option<Study>> {
        if let Some(study_id) = target.study_id {
            if let Some(study) = self.store.find_study(study_id).await? {
                return Ok(Some(study));
            }
        }
        if let Some(mapping) = equipment.default_study() {
            if let Some(study) = self.store.find_study(mapping.study_id).await? {
                return Ok(Some(study));
            }
        }
        self.store.any_active_study().await
    }

    /// 查找或补建可挂靠的就诊记录，同一患者串行化
    async fn find_or_create_visit(
        &self,
        equipment: &Equipment,
        patient_id: Uuid,
        study: Option<&Study>,
    ) -> Result<Uuid> {
        let lock = {
            let mut locks = self.visit_locks.lock().await;
            locks.entry(patient_id).or_default().clone()
        };
        let visit_id = {
            let _guard = lock.lock().await;
            self.visit_for(equipment, patient_id, study).await
        };
        drop(lock);
        Self::prune_lock(&self.visit_locks, &patient_id).await;
        visit_id
    }

    async fn visit_for(
        &self,
        equipment: &Equipment,
        patient_id: Uuid,
        study: Option<&Study>,
    ) -> Result<Uuid> {
        if let Some(visit) = self.store.find_recent_visit(patient_id).await? {
            return Ok(visit.id);
        }

        let visit = self
            .store
            .create_visit(Visit {
                id: Uuid::new_v4(),
                patient_id,
                study_id: study.map(|s| s.id),
                status: VisitStatus::Completada,
                reason: format!("Auto - {}", equipment.name),
                date: Utc::now(),
            })
            .await?;
        info!("minimal visit created for patient {} ({})", patient_id, visit.reason);
        Ok(visit.id)
    }

    #[cfg(test)]
    async fn lock_table_sizes(&self) -> (usize, usize) {
        (
            self.write_locks.lock().await.len(),
            self.visit_locks.lock().await.len(),
        )
    }
}
