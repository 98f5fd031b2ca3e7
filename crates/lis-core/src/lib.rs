//! # LIS Core
//!
//! 实验室设备集成引擎的核心模块，提供基础数据结构、错误定义和通用工具。

pub mod error;
pub mod models;
pub mod state_machine;
pub mod utils;

pub use error::{LisError, Result};
pub use models::*;
pub use state_machine::{ResultEvent, ResultStateMachine};
