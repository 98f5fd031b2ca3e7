//! 接收管道
//!
//! 把解码消息走完 规范化 → 标识解析 → 持久化 的全流程。
//! 标识未解析的结果进入重试队列；队列重放由定时器或补录事件触发。

use crate::resolver::{IdentifierResolver, Resolution, ResolverConfig};
use crate::retry_queue::RetryQueue;
use crate::store::AdminStore;
use crate::writer::{ResultWriter, WriteOutcome};
use chrono::{DateTime, Utc};
use lis_core::models::{
    DecodedMessage, DecodedValue, Equipment, EquipmentState, EquipmentStats, NormalizedResult,
    PendingEntry, Protocol, ResultPayload,
};
use lis_core::{LisError, Result};
use lis_protocol::ResultNormalizer;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 单条消息的接收结局
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// 已持久化（含重复投递命中幂等键的情况）
    Written(WriteOutcome),
    /// 标识未解析，已进入重试队列
    Queued,
    /// 消息不含任何观测值，忽略
    Empty,
}

/// 设备运行状态快照（供监控端点使用）
#[derive(Debug, Clone, Serialize)]
pub struct EquipmentStatus {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub protocol: Protocol,
    pub state: EquipmentState,
    pub stats: EquipmentStats,
}

/// 接收管道
pub struct IngestPipeline {
    equipment: RwLock<HashMap<Uuid, Equipment>>,
    normalizer: ResultNormalizer,
    resolver: IdentifierResolver,
    retry_queue: Arc<RetryQueue>,
    writer: ResultWriter,
    store: Arc<dyn AdminStore>,
    retry_notify: Notify,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<dyn AdminStore>,
        retry_queue: Arc<RetryQueue>,
        resolver_config: ResolverConfig,
        branch: Option<String>,
        equipment: Vec<Equipment>,
    ) -> Self {
        Self {
            equipment: RwLock::new(equipment.into_iter().map(|e| (e.id, e)).collect()),
            normalizer: ResultNormalizer::new(),
            resolver: IdentifierResolver::new(store.clone(), resolver_config),
            retry_queue,
            writer: ResultWriter::new(store.clone(), branch),
            store,
            retry_notify: Notify::new(),
        }
    }

    pub async fn equipment_by_id(&self, id: Uuid) -> Option<Equipment> {
        self.equipment.read().await.get(&id).cloned()
    }

    /// 按名称查设备（代理上报只带名称），忽略大小写
    pub async fn equipment_by_name(&self, name: &str) -> Option<Equipment> {
        let name = name.trim();
        self.equipment
            .read()
            .await
            .values()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub async fn equipment_list(&self) -> Vec<Equipment> {
        self.equipment.read().await.values().cloned().collect()
    }

    /// 所有设备的状态快照，统计取存储中的最新值
    pub async fn equipment_status(&self) -> Result<Vec<EquipmentStatus>> {
        let equipment = self.equipment.read().await;
        let mut status = Vec::with_capacity(equipment.len());
        for e in equipment.values() {
            status.push(EquipmentStatus {
                id: e.id,
                name: e.name.clone(),
                kind: format!("{:?}", e.kind).to_lowercase(),
                protocol: e.protocol,
                state: e.state,
                stats: self.store.equipment_stats(e.id).await?,
            });
        }
        status.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(status)
    }

    pub async fn queue_depth(&self) -> usize {
        self.retry_queue.depth().await
    }

    pub async fn queue_oldest_age_secs(&self) -> Option<i64> {
        self.retry_queue.oldest_age_secs().await
    }

    /// 管理端补录患者/发票后的唤醒钩子。
    ///
    /// 管道自身不产生管理记录，登记发生在 `AdminStore` 背后的外部系统；
    /// 嵌入方在补录完成后调用本方法，让服务端的重试循环立即跑一轮
    /// `reprocess_pending`，不必等下一个定时周期。
    pub fn trigger_retry(&self) {
        self.retry_notify.notify_one();
    }

    /// 等待下一次重试触发
    pub async fn retry_notified(&self) {
        self.retry_notify.notified().await;
    }

    /// 接收一条解码消息
    pub async fn ingest(
        &self,
        equipment_id: Uuid,
        message: &DecodedMessage,
        received_at: DateTime<Utc>,
    ) -> Result<IngestOutcome> {
        let equipment = self
            .equipment_by_id(equipment_id)
            .await
            .ok_or_else(|| LisError::NotFound(format!("设备不存在: {}", equipment_id)))?;

        if message.is_empty() {
            debug!("empty message from {}, ignored", equipment.name);
            return Ok(IngestOutcome::Empty);
        }

        let normalized = self.normalizer.normalize(&equipment, message, received_at);
        self.dispatch(&equipment, normalized).await
    }

    /// 接收一条代理上报的载荷
    pub async fn ingest_payload(&self, payload: &ResultPayload) -> Result<IngestOutcome> {
        let equipment = self
            .equipment_by_name(&payload.equipment_name)
            .await
            .ok_or_else(|| {
                LisError::NotFound(format!("设备未注册: {}", payload.equipment_name))
            })?;

        let message = DecodedMessage {
            raw_identifier: payload.identifier().map(|s| s.to_string()),
            values: payload
                .valores
                .iter()
                .map(|(code, v)| DecodedValue {
                    code: code.clone(),
                    value: v.valor.clone(),
                    unit: v.unidad.clone(),
                    reference_range: v.referencia.clone(),
                    flag: v.estado,
                })
                .collect(),
        };

        self.ingest(equipment.id, &message, payload.timestamp).await
    }

    /// 重放重试队列，返回 (本轮落库数, 剩余数)
    pub async fn reprocess_pending(&self) -> Result<(usize, usize)> {
        let snapshot = self.retry_queue.snapshot().await;
        if snapshot.is_empty() {
            return Ok((0, 0));
        }

        info!("reprocessing retry queue: {} entries", snapshot.len());
        let mut processed = 0;

        for entry in snapshot {
            let Some(equipment) = self.equipment_by_id(entry.equipment_id).await else {
                warn!("queued entry references unknown equipment {}", entry.equipment_id);
                continue;
            };

            match self.resolver.resolve(&entry.raw_identifier).await? {
                Resolution::Resolved(target) => {
                    let normalized = NormalizedResult {
                        equipment_id: entry.equipment_id,
                        raw_identifier: Some(entry.raw_identifier.clone()),
                        values: entry.values.clone(),
                        received_at: entry.received_at,
                    };
                    let outcome = self.writer.write(&equipment, &normalized, &target).await?;
                    self.retry_queue.remove(&entry.key()).await?;
                    info!(
                        "queued result resolved: identifier={} sample={}",
                        entry.raw_identifier, outcome.sample_code
                    );
                    processed += 1;
                }
                Resolution::Unresolved => {
                    debug!("identifier {} still unresolved", entry.raw_identifier);
                }
            }
        }

        let remaining = self.retry_queue.depth().await;
        Ok((processed, remaining))
    }

    async fn dispatch(
        &self,
        equipment: &Equipment,
        normalized: NormalizedResult,
    ) -> Result<IngestOutcome> {
        let raw_identifier = normalized.raw_identifier.clone().unwrap_or_default();

        match self.resolver.resolve(&raw_identifier).await? {
            Resolution::Resolved(target) => {
                let outcome = self.writer.write(equipment, &normalized, &target).await?;
                Ok(IngestOutcome::Written(outcome))
            }
            Resolution::Unresolved => {
                self.retry_queue
                    .enqueue(PendingEntry {
                        equipment_id: normalized.equipment_id,
                        raw_identifier,
                        values: normalized.values,
                        received_at: normalized.received_at,
                    })
                    .await?;
                Ok(IngestOutcome::Queued)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryAdminStore, Patient};
    use lis_core::models::{AbnormalFlag, EquipmentKind, PayloadValue, TransportConfig};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lis-pipeline-{}-{}.json", name, Uuid::new_v4()))
    }

    fn equipment() -> Equipment {
        Equipment {
            id: Uuid::new_v4(),
            name: "BC-6800".to_string(),
            brand: "Mindray".to_string(),
            model: "BC-6800".to_string(),
            kind: EquipmentKind::Hematologia,
            protocol: Protocol::Astm,
            transport: TransportConfig::default(),
            parameter_map: vec![],
            study_map: vec![],
            state: EquipmentState::Activo,
            stats: EquipmentStats::default(),
        }
    }

    fn message(identifier: &str) -> DecodedMessage {
        DecodedMessage {
            raw_identifier: Some(identifier.to_string()),
            values: vec![DecodedValue {
                code: "WBC".to_string(),
                value: "7.5".to_string(),
                unit: "10³/µL".to_string(),
                reference_range: "4.0-10.0".to_string(),
                flag: AbnormalFlag::Normal,
            }],
        }
    }

    async fn pipeline_with(
        store: Arc<InMemoryAdminStore>,
        eq: Equipment,
        queue_name: &str,
    ) -> (IngestPipeline, PathBuf) {
        let path = temp_path(queue_name);
        let queue = Arc::new(RetryQueue::load(&path).await.unwrap());
        let pipeline = IngestPipeline::new(
            store,
            queue,
            ResolverConfig::default(),
            None,
            vec![eq],
        );
        (pipeline, path)
    }

    #[tokio::test]
    async fn test_known_cedula_is_written() {
        let store = Arc::new(InMemoryAdminStore::new());
        let patient_id = Uuid::new_v4();
        store
            .insert_patient(Patient {
                id: patient_id,
                cedula: "00123456789".to_string(),
                first_name: "Juan".to_string(),
                last_name: "Perez".to_string(),
            })
            .await;

        let eq = equipment();
        let (pipeline, path) = pipeline_with(store.clone(), eq.clone(), "written").await;

        let outcome = pipeline
            .ingest(eq.id, &message("00123456789"), Utc::now())
            .await
            .unwrap();

        match outcome {
            IngestOutcome::Written(w) => assert!(!w.duplicate),
            other => panic!("expected Written, got {:?}", other),
        }
        assert_eq!(store.result_count().await, 1);
        assert_eq!(pipeline.queue_depth().await, 0);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_unresolved_goes_to_queue_then_reprocesses() {
        let store = Arc::new(InMemoryAdminStore::new());
        let eq = equipment();
        let (pipeline, path) = pipeline_with(store.clone(), eq.clone(), "reprocess").await;

        // 患者尚未录入 → 入队
        let outcome = pipeline
            .ingest(eq.id, &message("00199988877"), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Queued));
        assert_eq!(pipeline.queue_depth().await, 1);
        assert_eq!(store.result_count().await, 0);

        // 队列中的条目解析不动
        let (processed, remaining) = pipeline.reprocess_pending().await.unwrap();
        assert_eq!((processed, remaining), (0, 1));

        // 补录患者后重放成功
        store
            .insert_patient(Patient {
                id: Uuid::new_v4(),
                cedula: "00199988877".to_string(),
                first_name: "Ana".to_string(),
                last_name: "Gomez".to_string(),
            })
            .await;
        let (processed, remaining) = pipeline.reprocess_pending().await.unwrap();
        assert_eq!((processed, remaining), (1, 0));
        assert_eq!(store.result_count().await, 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_empty_message_is_ignored() {
        let store = Arc::new(InMemoryAdminStore::new());
        let eq = equipment();
        let (pipeline, path) = pipeline_with(store.clone(), eq.clone(), "empty").await;

        let outcome = pipeline
            .ingest(eq.id, &DecodedMessage::default(), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Empty));
        assert_eq!(store.result_count().await, 0);
        assert_eq!(pipeline.queue_depth().await, 0);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_trigger_retry_wakes_waiting_loop() {
        let store = Arc::new(InMemoryAdminStore::new());
        let eq = equipment();
        let (pipeline, path) = pipeline_with(store, eq, "trigger").await;
        let pipeline = Arc::new(pipeline);

        // 管理端补录后的唤醒要能打断等待中的重试循环
        let waiter = pipeline.clone();
        let waiting = tokio::spawn(async move { waiter.retry_notified().await });

        tokio::task::yield_now().await;
        pipeline.trigger_retry();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiting)
            .await
            .expect("retry loop was not woken")
            .unwrap();

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_ingest_payload_matches_equipment_by_name() {
        let store = Arc::new(InMemoryAdminStore::new());
        store
            .insert_patient(Patient {
                id: Uuid::new_v4(),
                cedula: "00111222333".to_string(),
                first_name: "Pedro".to_string(),
                last_name: "Diaz".to_string(),
            })
            .await;

        let eq = equipment();
        let (pipeline, path) = pipeline_with(store.clone(), eq.clone(), "payload").await;

        let mut valores = BTreeMap::new();
        valores.insert(
            "WBC".to_string(),
            PayloadValue {
                valor: "7.5".to_string(),
                unidad: "10³/µL".to_string(),
                referencia: "4.0-10.0".to_string(),
                estado: AbnormalFlag::Normal,
            },
        );
        let payload = ResultPayload {
            station_name: "sucursal-norte".to_string(),
            equipment_type: "hematologia".to_string(),
            // 名称大小写不一致也要匹配
            equipment_name: "bc-6800".to_string(),
            cedula: Some("00111222333".to_string()),
            paciente_id: None,
            tipo_estudio: "Hemograma".to_string(),
            valores,
            timestamp: Utc::now(),
        };

        let outcome = pipeline.ingest_payload(&payload).await.unwrap();
        assert!(matches!(outcome, IngestOutcome::Written(_)));

        // 未注册设备名 → 错误
        let mut unknown = payload.clone();
        unknown.equipment_name = "no-such-analyzer".to_string();
        assert!(pipeline.ingest_payload(&unknown).await.is_err());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
