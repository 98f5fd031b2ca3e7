//! 帧组装器
//!
//! 把无界字节流切分为完整的协议消息。每个连接持有自己的解码器实例，
//! 缓冲区随连接断开一起释放，不跨任务共享。

use bytes::{Buf, BytesMut};
use lis_core::LisError;
use tokio_util::codec::Decoder;
use tracing::warn;

/// 单帧缓冲上限。超限且仍未成帧的连接视为损坏，缓冲被丢弃。
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

const ETX: u8 = 0x03;
const VT: u8 = 0x0B;
const FS: u8 = 0x1C;
const CR: u8 = 0x0D;

/// ASTM帧解码器
///
/// 帧在出现终止记录（`L|` 开头的记录）或 ETX (0x03) 时视为完整，
/// 终止符之后的字节保留给下一帧。
#[derive(Debug, Default)]
pub struct AstmCodec;

impl AstmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for AstmCodec {
    type Item = String;
    type Error = LisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // ETX 终止
        if let Some(pos) = src.iter().position(|&b| b == ETX) {
            let frame = src.split_to(pos + 1);
            return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
        }

        // L| 终止记录: 帧到该记录行尾为止
        if let Some(pos) = find_terminator_record(src) {
            let end = src[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|nl| pos + nl + 1)
                .unwrap_or(src.len());
            let frame = src.split_to(end);
            return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
        }

        if src.len() > MAX_FRAME_BYTES {
            warn!("ASTM frame exceeded {} bytes without terminator, discarding buffer", MAX_FRAME_BYTES);
            src.clear();
            return Err(LisError::Decode("ASTM frame exceeds maximum size".to_string()));
        }

        Ok(None)
    }
}

/// 在缓冲中查找位于记录开头的 `L|`
fn find_terminator_record(src: &BytesMut) -> Option<usize> {
    for i in 0..src.len().saturating_sub(1) {
        if src[i] == b'L' && src[i + 1] == b'|' {
            // 必须位于缓冲开头或换行之后，避免命中数值里的字面 "L|"
            if i == 0 || src[i - 1] == b'\n' || src[i - 1] == b'\r' {
                return Some(i);
            }
        }
    }
    None
}

/// HL7 MLLP帧解码器
///
/// 帧是开始标记 VT (0x0B) 与结束对 FS+CR (0x1C 0x0D) 之间的字节；
/// VT 之前的杂散字节被丢弃以限制缓冲增长。
#[derive(Debug, Default)]
pub struct Hl7Codec;

impl Hl7Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Hl7Codec {
    type Item = String;
    type Error = LisError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let start = match src.iter().position(|&b| b == VT) {
            Some(pos) => pos,
            None => {
                // 没有开始标记，之前的字节不可能属于任何帧
                if !src.is_empty() {
                    src.clear();
                }
                return Ok(None);
            }
        };

        if start > 0 {
            src.advance(start);
        }

        let end = src
            .windows(2)
            .position(|w| w[0] == FS && w[1] == CR);

        match end {
            Some(end) => {
                let frame = src.split_to(end + 2);
                // 去掉 VT 前缀与 FS+CR 后缀
                let body = &frame[1..frame.len() - 2];
                Ok(Some(String::from_utf8_lossy(body).into_owned()))
            }
            None => {
                if src.len() > MAX_FRAME_BYTES {
                    warn!("HL7 frame exceeded {} bytes without end-of-block, discarding buffer", MAX_FRAME_BYTES);
                    src.clear();
                    return Err(LisError::Decode("HL7 frame exceeds maximum size".to_string()));
                }
                Ok(None)
            }
        }
    }
}
