//! 监听器状态
//!
//! 每个连接的生命周期: disconnected → listening → receiving → (帧完成) →
//! receiving …；传输错误进入 error，等待重连延迟后回到 listening。

use lis_core::models::Protocol;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 监听器运行状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "detail")]
pub enum ListenerState {
    Disconnected,
    Listening,
    Receiving,
    Error(String),
    Stopped,
}

/// 共享的状态单元，监听任务写、Supervisor读
pub type SharedState = Arc<RwLock<ListenerState>>;

pub fn shared_state() -> SharedState {
    Arc::new(RwLock::new(ListenerState::Disconnected))
}

pub async fn set_state(state: &SharedState, value: ListenerState) {
    *state.write().await = value;
}

/// 监听器状态快照（供监控端点使用）
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub equipment_id: Uuid,
    pub equipment_name: String,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub state: ListenerState,
}
