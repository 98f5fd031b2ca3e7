//! # LIS协议模块
//!
//! 实现各类分析仪的线协议处理，包括：
//! - 帧组装器，在字节流中检测消息边界（ASTM终止记录 / HL7块标记）
//! - ASTM E1394 风格管道分隔记录解码
//! - HL7 v2 段/字段消息解码与ACK应答合成
//! - 结果规范化（设备参数代码 → 系统参数）
//! - 工作订单编码（ASTM / HL7 下行）

pub mod astm;
pub mod frame;
pub mod generic;
pub mod hl7;
pub mod normalizer;
pub mod order;

pub use astm::AstmParser;
pub use frame::{AstmCodec, Hl7Codec, MAX_FRAME_BYTES};
pub use generic::decode_tcp_payload;
pub use hl7::Hl7Parser;
pub use normalizer::ResultNormalizer;
pub use order::{build_astm_order, build_hl7_order, TestRequest, WorkOrder};
