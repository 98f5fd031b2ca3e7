//! TCP监听器
//!
//! 每台TCP设备一个监听端口。连接内按到达顺序解码，解码消息经有界通道
//! 交给单个派发任务，保证同一设备的结果串行进入管道。
//! 绑定失败只记录错误并把该设备置为错误态，不影响其他监听器。

use crate::listener::{set_state, ListenerState, SharedState};
use chrono::{DateTime, Utc};
use lis_core::models::{DecodedMessage, Equipment, Protocol};
use lis_core::{LisError, Result};
use lis_pipeline::{IngestOutcome, IngestPipeline};
use lis_protocol::{decode_tcp_payload, AstmCodec, AstmParser, Hl7Codec, Hl7Parser, MAX_FRAME_BYTES};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

const ENQ: u8 = 0x05;
const ACK: u8 = 0x06;
const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

/// 单台设备的TCP监听器
pub struct TcpEquipmentListener {
    listener: TcpListener,
    equipment: Equipment,
    pipeline: Arc<IngestPipeline>,
    state: SharedState,
}

impl TcpEquipmentListener {
    pub async fn bind(
        equipment: Equipment,
        pipeline: Arc<IngestPipeline>,
        state: SharedState,
    ) -> Result<Self> {
        let port = equipment
            .transport
            .port
            .ok_or_else(|| LisError::Config(format!("设备 {} 未配置TCP端口", equipment.name)))?;
        let addr = format!("{}:{}", equipment.transport.host, port);
        let listener = TcpListener::bind(&addr).await?;

        info!("TCP监听器启动: 设备={} 地址={}", equipment.name, addr);
        Ok(Self {
            listener,
            equipment,
            pipeline,
            state,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// 接受连接直到收到停止信号，停机前完成在途帧的派发
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        set_state(&self.state, ListenerState::Listening).await;

        // 有界通道 + 单派发任务: 同设备消息严格按到达顺序入库
        let (tx, rx) = mpsc::channel::<(DecodedMessage, DateTime<Utc>)>(64);
        let dispatch = tokio::spawn(dispatch_loop(
            self.pipeline.clone(),
            self.equipment.clone(),
            rx,
        ));

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("接受连接: 设备={} 来源={}", self.equipment.name, peer);
                        let equipment = self.equipment.clone();
                        let tx = tx.clone();
                        let state = self.state.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &equipment, tx, state.clone(), shutdown).await {
                                warn!("连接处理失败: 设备={} 错误={}", equipment.name, e);
                            }
                            set_state(&state, ListenerState::Listening).await;
                        });
                    }
                    Err(e) => {
                        error!("接受连接失败: 设备={} 错误={}", self.equipment.name, e);
                    }
                },
            }
        }

        // 释放发送端，派发任务清空通道后退出
        drop(tx);
        if let Err(e) = dispatch.await {
            error!("派发任务异常退出: {}", e);
        }
        set_state(&self.state, ListenerState::Stopped).await;
        info!("TCP监听器停止: 设备={}", self.equipment.name);
    }
}

/// 绑定并运行，绑定失败只影响本设备
pub async fn run_tcp_listener(
    equipment: Equipment,
    pipeline: Arc<IngestPipeline>,
    state: SharedState,
    shutdown: watch::Receiver<bool>,
) {
    match TcpEquipmentListener::bind(equipment.clone(), pipeline, state.clone()).await {
        Ok(listener) => listener.run(shutdown).await,
        Err(e) => {
            error!("TCP绑定失败: 设备={} 错误={}", equipment.name, e);
            set_state(&state, ListenerState::Error(e.to_string())).await;
        }
    }
}

async fn dispatch_loop(
    pipeline: Arc<IngestPipeline>,
    equipment: Equipment,
    mut rx: mpsc::Receiver<(DecodedMessage, DateTime<Utc>)>,
) {
    while let Some((message, received_at)) = rx.recv().await {
        match pipeline.ingest(equipment.id, &message, received_at).await {
            Ok(IngestOutcome::Written(outcome)) => {
                info!("结果入库: 设备={} 样本={}", equipment.name, outcome.sample_code);
            }
            Ok(IngestOutcome::Queued) => {
                info!("结果入重试队列: 设备={}", equipment.name);
            }
            Ok(IngestOutcome::Empty) => {
                debug!("空消息忽略: 设备={}", equipment.name);
            }
            Err(e) => {
                error!("结果处理失败: 设备={} 错误={}", equipment.name, e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    equipment: &Equipment,
    tx: mpsc::Sender<(DecodedMessage, DateTime<Utc>)>,
    state: SharedState,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match equipment.protocol {
        Protocol::Astm => handle_astm(stream, equipment, tx, state, shutdown).await,
        Protocol::Hl7 => handle_hl7(stream, equipment, tx, state, shutdown).await,
        // 通用TCP: 连接关闭即一条消息
        _ => handle_generic(stream, equipment, tx, state, shutdown).await,
    }
}

/// ASTM over TCP: ENQ → ACK 握手，每帧解码后回 ACK
async fn handle_astm(
    mut stream: TcpStream,
    equipment: &Equipment,
    tx: mpsc::Sender<(DecodedMessage, DateTime<Utc>)>,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let io_timeout = Duration::from_secs(equipment.transport.io_timeout_secs);
    let parser = AstmParser::new();
    let mut codec = AstmCodec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            read = timeout(io_timeout, stream.read(&mut chunk)) => match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(LisError::Transport(e)),
                Err(_) => {
                    debug!("读超时，关闭连接: 设备={}", equipment.name);
                    return Ok(());
                }
            },
        };

        // 会话握手: ENQ 立即应答 ACK
        if chunk[..n].contains(&ENQ) {
            stream.write_all(&[ACK]).await?;
        }
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    set_state(&state, ListenerState::Receiving).await;
                    let message = parser.parse(&frame);
                    if tx.send((message, Utc::now())).await.is_err() {
                        return Ok(());
                    }
                    stream.write_all(&[ACK]).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("ASTM帧损坏: 设备={} 错误={}", equipment.name, e);
                    break;
                }
            }
        }
    }
}

/// HL7 over MLLP: 每条识别出的消息在同一连接上立即回 ACK
async fn handle_hl7(
    mut stream: TcpStream,
    equipment: &Equipment,
    tx: mpsc::Sender<(DecodedMessage, DateTime<Utc>)>,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let io_timeout = Duration::from_secs(equipment.transport.io_timeout_secs);
    let parser = Hl7Parser::new();
    let mut codec = Hl7Codec::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
            read = timeout(io_timeout, stream.read(&mut chunk)) => match read {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(LisError::Transport(e)),
                Err(_) => {
                    debug!("读超时，关闭连接: 设备={}", equipment.name);
                    return Ok(());
                }
            },
        };
        buf.extend_from_slice(&chunk[..n]);

        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    set_state(&state, ListenerState::Receiving).await;
                    let ack = parser.generate_ack(&frame);
                    let message = parser.parse(&frame);
                    if tx.send((message, Utc::now())).await.is_err() {
                        return Ok(());
                    }

                    // MLLP封装的ACK原路返回
                    let mut reply = Vec::with_capacity(ack.len() + 3);
                    reply.push(VT);
                    reply.extend_from_slice(ack.as_bytes());
                    reply.push(FS);
                    reply.push(CR);
                    stream.write_all(&reply).await?;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("HL7帧损坏: 设备={} 错误={}", equipment.name, e);
                    break;
                }
            }
        }
    }
}

/// 通用TCP: 设备连接-发送-断开，整个会话的字节是一条消息
async fn handle_generic(
    mut stream: TcpStream,
    equipment: &Equipment,
    tx: mpsc::Sender<(DecodedMessage, DateTime<Utc>)>,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let io_timeout = Duration::from_secs(equipment.transport.io_timeout_secs);
    let mut buf = BytesMut::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            read = timeout(io_timeout, stream.read(&mut chunk)) => match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(LisError::Transport(e)),
                Err(_) => {
                    debug!("读超时，按消息结束处理: 设备={}", equipment.name);
                    break;
                }
            },
        };
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_FRAME_BYTES {
            return Err(LisError::Decode("TCP消息超出大小上限".to_string()));
        }
    }

    if buf.is_empty() {
        return Ok(());
    }

    set_state(&state, ListenerState::Receiving).await;
    let message = decode_tcp_payload(&String::from_utf8_lossy(&buf));
    let _ = tx.send((message, Utc::now())).await;
    Ok(())
}
