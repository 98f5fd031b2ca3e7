//! # LIS处理管道
//!
//! 规范化 → 标识解析 → 持久化的完整接收管道，包括：
//! - 管理记录存储的协作接口（发票/患者/就诊只读，结果/就诊可写）
//! - 标识解析级联（LIS短码 → 身份证号 → 重试队列）
//! - 可持久化的重试队列，等待补录的管理记录
//! - 幂等的结果写入器，自动补建最小就诊记录

pub mod pipeline;
pub mod resolver;
pub mod retry_queue;
pub mod store;
pub mod writer;

pub use pipeline::{EquipmentStatus, IngestOutcome, IngestPipeline};
pub use resolver::{IdentifierResolver, Resolution, ResolverConfig};
pub use retry_queue::RetryQueue;
pub use store::{AdminStore, InMemoryAdminStore, Invoice, Patient, StatsUpdate, Study, Visit, VisitStatus};
pub use writer::{ResultWriter, WriteOutcome};
