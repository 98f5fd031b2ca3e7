//! 串口监听器
//!
//! 只在启用 `serial` 编译特性时可用。未启用时监听器明确上报
//! "serial unsupported on this build" 并把设备置为错误态，绝不静默降级。
//! 打开/读写错误按配置延迟（默认10秒）重连，不终止进程。

use crate::listener::{set_state, ListenerState, SharedState};
use lis_core::models::Equipment;
use lis_pipeline::IngestPipeline;
use std::sync::Arc;
use tokio::sync::watch;

#[cfg(not(feature = "serial"))]
pub async fn run_serial_listener(
    equipment: Equipment,
    _pipeline: Arc<IngestPipeline>,
    state: SharedState,
    _shutdown: watch::Receiver<bool>,
) {
    tracing::error!(
        "串口监听器不可用: 设备={} serial unsupported on this build",
        equipment.name
    );
    set_state(
        &state,
        ListenerState::Error("serial unsupported on this build".to_string()),
    )
    .await;
}

#[cfg(feature = "serial")]
pub async fn run_serial_listener(
    equipment: Equipment,
    pipeline: Arc<IngestPipeline>,
    state: SharedState,
    shutdown: watch::Receiver<bool>,
) {
    imp::run(equipment, pipeline, state, shutdown).await
}

#[cfg(feature = "serial")]
mod imp {
    use super::*;
    use bytes::BytesMut;
    use chrono::Utc;
    use lis_core::models::Parity;
    use lis_core::LisError;
    use lis_pipeline::IngestOutcome;
    use lis_protocol::{AstmCodec, AstmParser};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio_serial::{DataBits, SerialPortBuilderExt, SerialStream, StopBits};
    use tokio_util::codec::Decoder;
    use tracing::{debug, error, info, warn};

    pub async fn run(
        equipment: Equipment,
        pipeline: Arc<IngestPipeline>,
        state: SharedState,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(path) = equipment.transport.serial_path.clone() else {
            error!("设备 {} 未配置串口路径", equipment.name);
            set_state(&state, ListenerState::Error("missing serial path".to_string())).await;
            return;
        };
        let reconnect = Duration::from_secs(equipment.transport.reconnect_delay_secs);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match open_port(&equipment, &path) {
                Ok(port) => {
                    info!("串口打开: 设备={} 路径={}", equipment.name, path);
                    set_state(&state, ListenerState::Listening).await;
                    if let Err(e) =
                        read_loop(port, &equipment, &pipeline, &state, &mut shutdown).await
                    {
                        warn!("串口读取失败: 设备={} 错误={}", equipment.name, e);
                        set_state(&state, ListenerState::Error(e.to_string())).await;
                    }
                }
                Err(e) => {
                    warn!("串口打开失败: 设备={} 错误={}", equipment.name, e);
                    set_state(&state, ListenerState::Error(e.to_string())).await;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            // 配置的延迟后重连
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(reconnect) => {}
            }
        }

        set_state(&state, ListenerState::Stopped).await;
        info!("串口监听器停止: 设备={}", equipment.name);
    }

    fn open_port(equipment: &Equipment, path: &str) -> Result<SerialStream, LisError> {
        let t = &equipment.transport;
        let data_bits = match t.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };
        let stop_bits = match t.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };
        let parity = match t.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        tokio_serial::new(path, t.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .open_native_async()
            .map_err(|e| LisError::Config(format!("无法打开串口 {}: {}", path, e)))
    }

    async fn read_loop(
        mut port: SerialStream,
        equipment: &Equipment,
        pipeline: &Arc<IngestPipeline>,
        state: &SharedState,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), LisError> {
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
                read = port.read(&mut chunk) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => return Err(LisError::Transport(e)),
                },
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => {
                        set_state(state, ListenerState::Receiving).await;
                        let message = parser.parse(&frame);
                        match pipeline.ingest(equipment.id, &message, Utc::now()).await {
                            Ok(IngestOutcome::Written(o)) => {
                                info!("结果入库: 设备={} 样本={}", equipment.name, o.sample_code);
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
                        set_state(state, ListenerState::Listening).await;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("串口帧损坏: 设备={} 错误={}", equipment.name, e);
                        break;
                    }
                }
            }
        }
    }
}
