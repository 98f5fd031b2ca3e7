//! LIS中心服务主程序

mod config;

use crate::config::Settings;
use clap::Parser;
use lis_core::{LisError, Result};
use lis_ingest::{ApiState, IngestServer};
use lis_pipeline::{IngestPipeline, InMemoryAdminStore, RetryQueue};
use lis_transport::Supervisor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// LIS中心服务命令行参数
#[derive(Parser, Debug)]
#[command(name = "lis-server")]
#[command(about = "检验设备集成引擎 - 中心服务")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/server")]
    config: String,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    info!("启动LIS中心服务...");

    let settings = Settings::load(&args.config)?;
    let http_addr: SocketAddr = settings
        .http_addr
        .parse()
        .map_err(|e| LisError::Config(format!("无效的HTTP地址 {}: {}", settings.http_addr, e)))?;

    info!("LIS中心服务配置:");
    info!("  HTTP地址: {}", http_addr);
    info!("  重试队列: {}", settings.retry_queue_path.display());
    info!("  重放间隔: {}s", settings.retry_interval_secs);
    info!("  设备数量: {}", settings.equipment.len());

    // 管理存储: 演示装配用内存实现，生产部署换成管理系统适配器
    let store = Arc::new(InMemoryAdminStore::new());
    let retry_queue = Arc::new(RetryQueue::load(&settings.retry_queue_path).await?);

    let pipeline = Arc::new(IngestPipeline::new(
        store,
        retry_queue,
        settings.resolver.clone(),
        settings.branch.clone(),
        settings.equipment.clone(),
    ));

    // 设备监听器
    let supervisor = Arc::new(Supervisor::new(pipeline.clone()));
    supervisor.start_all().await?;

    // 重试队列重放: 定时 + 补录事件唤醒
    let retry_pipeline = pipeline.clone();
    let retry_interval = settings.retry_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(retry_interval));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = retry_pipeline.retry_notified() => {}
            }
            match retry_pipeline.reprocess_pending().await {
                Ok((0, 0)) => {}
                Ok((processed, remaining)) => {
                    info!("重试队列重放: 入库={} 剩余={}", processed, remaining);
                }
                Err(e) => warn!("重试队列重放失败: {}", e),
            }
        }
    });

    // HTTP接收端
    let server = IngestServer::new(
        http_addr,
        ApiState {
            pipeline: pipeline.clone(),
            supervisor: supervisor.clone(),
        },
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("HTTP服务异常退出: {}", e);
                supervisor.stop_all().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到停止信号，开始优雅停机...");
        }
    }

    supervisor.stop_all().await;
    info!("LIS中心服务已停止");
    Ok(())
}
