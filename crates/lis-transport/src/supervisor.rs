//! 监听器Supervisor
//!
//! 显式注册表管理所有设备监听器: 启动、单独停止、状态查询。
//! 停止是优雅的: 发 watch 停止信号，在途帧完成后资源才释放。

use crate::file_poll::run_file_poller;
use crate::listener::{shared_state, ListenerState, ListenerStatus, SharedState};
use crate::serial::run_serial_listener;
use crate::tcp::run_tcp_listener;
use lis_core::models::{Equipment, EquipmentState, Protocol};
use lis_core::{LisError, Result};
use lis_pipeline::IngestPipeline;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// 单个监听器的注册表句柄
struct ListenerHandle {
    equipment_name: String,
    protocol: Protocol,
    state: SharedState,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// 监听器Supervisor
pub struct Supervisor {
    pipeline: Arc<IngestPipeline>,
    handles: Mutex<HashMap<Uuid, ListenerHandle>>,
}

impl Supervisor {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            pipeline,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// 启动所有激活设备的监听器，未激活设备记录日志后跳过
    pub async fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for equipment in self.pipeline.equipment_list().await {
            if equipment.state != EquipmentState::Activo {
                info!("设备未激活，跳过监听器: {}", equipment.name);
                continue;
            }
            match self.start(equipment).await {
                Ok(()) => started += 1,
                Err(e) => error!("监听器启动失败: {}", e),
            }
        }
        info!("Supervisor启动完成: {} 个监听器", started);
        Ok(started)
    }

    /// 启动一台设备的监听器
    pub async fn start(&self, equipment: Equipment) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if handles.contains_key(&equipment.id) {
            return Err(LisError::Config(format!(
                "设备 {} 的监听器已在运行",
                equipment.name
            )));
        }

        let state = shared_state();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = self.pipeline.clone();

        let task = match equipment.protocol {
            Protocol::Astm | Protocol::Hl7 | Protocol::Tcp => tokio::spawn(run_tcp_listener(
                equipment.clone(),
                pipeline,
                state.clone(),
                shutdown_rx,
            )),
            Protocol::Serial => tokio::spawn(run_serial_listener(
                equipment.clone(),
                pipeline,
                state.clone(),
                shutdown_rx,
            )),
            Protocol::File => tokio::spawn(run_file_poller(
                equipment.clone(),
                pipeline,
                state.clone(),
                shutdown_rx,
            )),
        };

        handles.insert(
            equipment.id,
            ListenerHandle {
                equipment_name: equipment.name,
                protocol: equipment.protocol,
                state,
                shutdown: shutdown_tx,
                task,
            },
        );
        Ok(())
    }

    /// 停止一台设备的监听器，不影响其他设备
    pub async fn stop(&self, equipment_id: Uuid) -> Result<()> {
        let handle = {
            let mut handles = self.handles.lock().await;
            handles.remove(&equipment_id).ok_or_else(|| {
                LisError::NotFound(format!("监听器不存在: {}", equipment_id))
            })?
        };

        info!("停止监听器: 设备={}", handle.equipment_name);
        let _ = handle.shutdown.send(true);
        if let Err(e) = handle.task.await {
            warn!("监听任务异常退出: 设备={} 错误={}", handle.equipment_name, e);
        }
        Ok(())
    }

    /// 停止所有监听器
    pub async fn stop_all(&self) {
        let ids: Vec<Uuid> = self.handles.lock().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.stop(id).await {
                warn!("停止监听器失败: {}", e);
            }
        }
    }

    /// 所有监听器的状态快照
    pub async fn status(&self) -> Vec<ListenerStatus> {
        let handles = self.handles.lock().await;
        let mut status = Vec::with_capacity(handles.len());
        for (id, handle) in handles.iter() {
            status.push(ListenerStatus {
                equipment_id: *id,
                equipment_name: handle.equipment_name.clone(),
                protocol: handle.protocol,
                state: handle.state.read().await.clone(),
            });
        }
        status.sort_by(|a, b| a.equipment_name.cmp(&b.equipment_name));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::models::{EquipmentKind, EquipmentStats, TransportConfig};
    use lis_pipeline::{InMemoryAdminStore, ResolverConfig, RetryQueue};
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp_queue(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lis-sup-{}-{}.json", name, Uuid::new_v4()))
    }

    fn tcp_equipment(name: &str, state: EquipmentState) -> Equipment {
        Equipment {
            id: Uuid::new_v4(),
            name: name.to_string(),
            brand: "Mindray".to_string(),
            model: "BS-200".to_string(),
            kind: EquipmentKind::Quimica,
            protocol: Protocol::Tcp,
            transport: TransportConfig {
                port: Some(0),
                ..TransportConfig::default()
            },
            parameter_map: vec![],
            study_map: vec![],
            state,
            stats: EquipmentStats::default(),
        }
    }

    async fn supervisor_with(equipment: Vec<Equipment>, queue: &PathBuf) -> Supervisor {
        let retry = Arc::new(RetryQueue::load(queue).await.unwrap());
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::new(InMemoryAdminStore::new()),
            retry,
            ResolverConfig::default(),
            None,
            equipment,
        ));
        Supervisor::new(pipeline)
    }

    #[tokio::test]
    async fn test_start_all_skips_inactive_equipment() {
        let queue = temp_queue("inactive");
        let active = tcp_equipment("BS-200", EquipmentState::Activo);
        let inactive = tcp_equipment("BC-6800", EquipmentState::Inactivo);
        let supervisor = supervisor_with(vec![active, inactive], &queue).await;

        let started = supervisor.start_all().await.unwrap();
        assert_eq!(started, 1);
        assert_eq!(supervisor.status().await.len(), 1);

        supervisor.stop_all().await;
        let _ = tokio::fs::remove_file(&queue).await;
    }

    #[tokio::test]
    async fn test_stop_one_leaves_others_running() {
        let queue = temp_queue("stop-one");
        let a = tcp_equipment("BS-200", EquipmentState::Activo);
        let b = tcp_equipment("BC-6800", EquipmentState::Activo);
        let a_id = a.id;
        let supervisor = supervisor_with(vec![a, b], &queue).await;

        supervisor.start_all().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        supervisor.stop(a_id).await.unwrap();

        let status = supervisor.status().await;
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].equipment_name, "BC-6800");
        assert_eq!(status[0].state, ListenerState::Listening);

        supervisor.stop_all().await;
        let _ = tokio::fs::remove_file(&queue).await;
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let queue = temp_queue("double");
        let eq = tcp_equipment("BS-200", EquipmentState::Activo);
        let supervisor = supervisor_with(vec![eq.clone()], &queue).await;

        supervisor.start(eq.clone()).await.unwrap();
        assert!(supervisor.start(eq).await.is_err());

        supervisor.stop_all().await;
        let _ = tokio::fs::remove_file(&queue).await;
    }
}
