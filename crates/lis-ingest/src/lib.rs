//! # 中心接收端
//!
//! 接收边缘采集代理上报的结果、暴露重试队列的手动触发与设备状态查询。
//! 路由路径与历史代理兼容，应答里的 codigoMuestra 同时出现在顶层和
//! data 里（老版本代理读 data）。

pub mod handlers;
pub mod server;

pub use handlers::ApiState;
pub use server::IngestServer;
