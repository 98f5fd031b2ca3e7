//! # 设备传输层
//!
//! 每台设备一个独立监听器，独占自己的传输资源（TCP端口/串口/轮询目录）。
//! 监听器之间互不影响：绑定失败只让该设备进入错误态，不影响进程。
//! Supervisor 统一管理监听器的启停与状态查询。

pub mod file_poll;
pub mod listener;
pub mod serial;
pub mod supervisor;
pub mod tcp;

pub use listener::{ListenerState, ListenerStatus};
pub use supervisor::Supervisor;
