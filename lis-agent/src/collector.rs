//! 本地采集
//!
//! 在采集站上运行与中心相同的帧组装/解码/规范化，但不做标识解析——
//! 解析在中心完成。每台设备一个监听任务，解码出的结果立即上报，
//! 发送失败的载荷进本地队列，绝不阻塞后续消息。

use crate::config::AgentEquipment;
use crate::queue::AgentQueue;
use crate::sender::{build_payload, ResultSender};
use bytes::BytesMut;
use chrono::Utc;
use lis_core::models::{DecodedMessage, Equipment, Protocol};
use lis_core::{LisError, Result};
use lis_protocol::{
    decode_tcp_payload, AstmCodec, AstmParser, Hl7Codec, Hl7Parser, ResultNormalizer,
    MAX_FRAME_BYTES,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

const ENQ: u8 = 0x05;
const ACK: u8 = 0x06;
const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

/// 采集器共享上下文
pub struct Collector {
    station_name: String,
    sender: Arc<ResultSender>,
    queue: Arc<AgentQueue>,
    normalizer: ResultNormalizer,
}

impl Collector {
    pub fn new(station_name: String, sender: Arc<ResultSender>, queue: Arc<AgentQueue>) -> Self {
        Self {
            station_name,
            sender,
            queue,
            normalizer: ResultNormalizer::new(),
        }
    }

    /// 规范化并上报一条解码消息；发送失败时落盘
    pub async fn deliver(
        &self,
        cfg: &AgentEquipment,
        equipment: &Equipment,
        message: &DecodedMessage,
    ) {
        if message.is_empty() {
            debug!("空消息忽略: 设备={}", cfg.name);
            return;
        }

        let normalized = self.normalizer.normalize(equipment, message, Utc::now());
        let payload = build_payload(&self.station_name, cfg, &normalized);

        match self.sender.send(&payload).await {
            Ok(reply) => {
                info!(
                    "结果上报成功: 设备={} 样本={}",
                    cfg.name,
                    reply.codigo_muestra.as_deref().unwrap_or("-")
                );
            }
            Err(e) => {
                warn!("结果上报失败: 设备={} 错误={}", cfg.name, e);
                if let Err(e) = self.queue.push(payload).await {
                    error!("本地队列写入失败: {}", e);
                }
            }
        }
    }
}

/// 启动一台设备的采集任务；不支持的协议警告后跳过
pub fn spawn_equipment(collector: Arc<Collector>, cfg: AgentEquipment) {
    match cfg.protocol {
        Protocol::Astm | Protocol::Hl7 | Protocol::Tcp => {
            tokio::spawn(async move {
                if let Err(e) = run_tcp_collector(collector, &cfg).await {
                    error!("TCP采集任务退出: 设备={} 错误={}", cfg.name, e);
                }
            });
        }
        Protocol::File => {
            tokio::spawn(async move {
                if let Err(e) = run_file_collector(collector, &cfg).await {
                    error!("目录采集任务退出: 设备={} 错误={}", cfg.name, e);
                }
            });
        }
        Protocol::Serial => {
            warn!("代理不支持串口采集，跳过设备: {}", cfg.name);
        }
    }
}

async fn run_tcp_collector(collector: Arc<Collector>, cfg: &AgentEquipment) -> Result<()> {
    let port = cfg
        .transport
        .port
        .ok_or_else(|| LisError::Config(format!("设备 {} 未配置TCP端口", cfg.name)))?;
    let addr = format!("{}:{}", cfg.transport.host, port);
    let listener = TcpListener::bind(&addr).await?;
    info!("采集监听启动: 设备={} 地址={}", cfg.name, addr);

    let equipment = cfg.to_equipment();
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("接受连接: 设备={} 来源={}", cfg.name, peer);
                let collector = collector.clone();
                let cfg = cfg.clone();
                let equipment = equipment.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, &collector, &cfg, &equipment).await {
                        warn!("连接处理失败: 设备={} 错误={}", cfg.name, e);
                    }
                });
            }
            Err(e) => error!("接受连接失败: 设备={} 错误={}", cfg.name, e),
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    collector: &Collector,
    cfg: &AgentEquipment,
    equipment: &Equipment,
) -> Result<()> {
    let io_timeout = Duration::from_secs(cfg.transport.io_timeout_secs);
    let astm_parser = AstmParser::new();
    let hl7_parser = Hl7Parser::new();
    let mut astm_codec = AstmCodec::new();
    let mut hl7_codec = Hl7Codec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match timeout(io_timeout, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(LisError::Transport(e)),
            Err(_) => {
                debug!("读超时，关闭连接: 设备={}", cfg.name);
                break;
            }
        };

        if cfg.protocol == Protocol::Astm && chunk[..n].contains(&ENQ) {
            stream.write_all(&[ACK]).await?;
        }
        buf.extend_from_slice(&chunk[..n]);

        match cfg.protocol {
            Protocol::Astm => loop {
                match astm_codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        collector
                            .deliver(cfg, equipment, &astm_parser.parse(&frame))
                            .await;
                        stream.write_all(&[ACK]).await?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("ASTM帧损坏: 设备={} 错误={}", cfg.name, e);
                        break;
                    }
                }
            },
            Protocol::Hl7 => loop {
                match hl7_codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        let ack = hl7_parser.generate_ack(&frame);
                        collector
                            .deliver(cfg, equipment, &hl7_parser.parse(&frame))
                            .await;

                        let mut reply = Vec::with_capacity(ack.len() + 3);
                        reply.push(VT);
                        reply.extend_from_slice(ack.as_bytes());
                        reply.push(FS);
                        reply.push(CR);
                        stream.write_all(&reply).await?;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("HL7帧损坏: 设备={} 错误={}", cfg.name, e);
                        break;
                    }
                }
            },
            // 通用TCP: 断开即消息结束，只限制缓冲大小
            _ => {
                if buf.len() > MAX_FRAME_BYTES {
                    return Err(LisError::Decode("TCP消息超出大小上限".to_string()));
                }
            }
        }
    }

    if matches!(cfg.protocol, Protocol::Tcp) && !buf.is_empty() {
        let message = decode_tcp_payload(&String::from_utf8_lossy(&buf));
        collector.deliver(cfg, equipment, &message).await;
    }
    Ok(())
}

async fn run_file_collector(collector: Arc<Collector>, cfg: &AgentEquipment) -> Result<()> {
    let watch_dir = cfg
        .transport
        .watch_dir
        .clone()
        .ok_or_else(|| LisError::Config(format!("设备 {} 未配置轮询目录", cfg.name)))?;
    let processed = watch_dir.join("processed");
    tokio::fs::create_dir_all(&processed).await?;

    info!(
        "采集目录轮询启动: 设备={} 目录={} 间隔={}s",
        cfg.name,
        watch_dir.display(),
        cfg.transport.poll_interval_secs
    );

    let equipment = cfg.to_equipment();
    let mut ticker =
        tokio::time::interval(Duration::from_secs(cfg.transport.poll_interval_secs));
    loop {
        ticker.tick().await;

        let mut dir = match tokio::fs::read_dir(&watch_dir).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("轮询目录读取失败: 设备={} 错误={}", cfg.name, e);
                continue;
            }
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file || !matches_pattern(&path, cfg.transport.pattern.as_deref()) {
                continue;
            }

            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    let message = decode_tcp_payload(&content);
                    collector.deliver(cfg, &equipment, &message).await;
                }
                Err(e) => warn!("结果文件读取失败: 文件={} 错误={}", path.display(), e),
            }

            if let Some(name) = path.file_name() {
                if let Err(e) = tokio::fs::rename(&path, processed.join(name)).await {
                    warn!("结果文件移动失败: 文件={} 错误={}", path.display(), e);
                }
            }
        }
    }
}

/// 文件名匹配: 无模式匹配一切；`*.ext` 匹配扩展名；其他按子串匹配
fn matches_pattern(path: &std::path::Path, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else {
        name.contains(pattern)
    }
}
