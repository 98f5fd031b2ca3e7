//! 采集代理主程序
//!
//! 部署在各采集站，监听本地设备、规范化结果并上报中心。
//! `--test` 模式不启动任何监听，只发一条合成结果验证连通性。

mod collector;
mod config;
mod queue;
mod sender;

use crate::collector::{spawn_equipment, Collector};
use crate::config::AgentSettings;
use crate::queue::AgentQueue;
use crate::sender::{test_payload, ResultSender};
use clap::Parser;
use lis_core::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 本地队列重放间隔
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// 采集代理命令行参数
#[derive(Parser, Debug)]
#[command(name = "lis-agent")]
#[command(about = "检验设备集成引擎 - 采集代理")]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config/agent")]
    config: String,

    /// 发送一条合成结果验证连通性后退出
    #[arg(long)]
    test: bool,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .init();

    // 配置读不出来是无法恢复的启动失败
    let settings = match AgentSettings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("配置加载失败: {}", e);
            std::process::exit(1);
        }
    };

    let sender = Arc::new(ResultSender::new(settings.ingest_url())?);

    if args.test {
        return run_test(&settings, &sender).await;
    }

    info!("启动采集代理: 站点={}", settings.station_name);
    let queue = Arc::new(AgentQueue::load(&settings.queue_path).await?);
    let collector = Arc::new(Collector::new(
        settings.station_name.clone(),
        sender.clone(),
        queue.clone(),
    ));

    let mut started = 0;
    for cfg in &settings.equipment {
        if !cfg.active {
            info!("设备未激活，跳过: {}", cfg.name);
            continue;
        }
        spawn_equipment(collector.clone(), cfg.clone());
        started += 1;
    }
    info!("采集任务启动完成: {} 台设备", started);

    // 队列重放: 固定间隔，最老优先
    let flush_queue = queue.clone();
    let flush_sender = sender.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        ticker.tick().await; // 跳过启动时的立即触发
        loop {
            ticker.tick().await;
            let sender = flush_sender.clone();
            match flush_queue
                .flush(|p| {
                    let sender = sender.clone();
                    async move { sender.send(&p).await.map(|_| ()) }
                })
                .await
            {
                Ok((0, 0)) => {}
                Ok((sent, remaining)) => {
                    info!("队列重放完成: 送达={} 剩余={}", sent, remaining);
                }
                Err(e) => warn!("队列重放失败: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("收到停止信号，采集代理退出");
    Ok(())
}

/// `--test`: 发一条合成血常规验证代理与中心的连通性
async fn run_test(settings: &AgentSettings, sender: &ResultSender) -> Result<()> {
    info!("连通性测试: {}", settings.ingest_url());
    let payload = test_payload(&settings.station_name);

    match sender.send(&payload).await {
        Ok(reply) => {
            println!("{}", serde_json::to_string_pretty(&reply)?);
            info!("连通性测试成功");
            Ok(())
        }
        Err(e) => {
            error!("连通性测试失败: {}", e);
            std::process::exit(1);
        }
    }
}
