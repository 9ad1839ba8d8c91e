//! Profe - Rust 西班牙语陪练引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **model**: 领域类型（轮次、标注、词卡、快照、单元状态）
//! - **store**: SQLite 持久化与每轮原子提交
//! - **context**: 有界上下文组装（轮数/token 预算）
//! - **correction**: 错误追踪与隐式/显式纠正升降级
//! - **review**: SM-2 间隔重复与闪卡会话
//! - **proficiency**: 滑动窗口上的加权能力合成分
//! - **curriculum**: 单元目录与晋级状态机
//! - **llm**: 生成客户端抽象与错误检测协作方
//! - **session**: 每学习者串行的轮次编排

pub mod config;
pub mod context;
pub mod correction;
pub mod curriculum;
pub mod error;
pub mod llm;
pub mod model;
pub mod observability;
pub mod proficiency;
pub mod review;
pub mod session;
pub mod store;

pub use error::EngineError;
pub use session::{TurnOutcome, TutorEngine};
