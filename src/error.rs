//! 引擎错误类型
//!
//! 分类对应处理策略：瞬态协作方失败可重试；无效标注跳过不致命；
//! 持久化失败整轮回滚；会话冲突仅使当轮失败。

use thiserror::Error;

/// 引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum EngineError {
    /// 生成协作方超时（瞬态，按退避重试）
    #[error("Generation timeout after {0} attempts")]
    GenerationTimeout(u32),

    /// 生成协作方失败（限流、格式错误等）
    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    /// 检测协作方返回了封闭体系之外的分类（拒绝并记日志，不持久化）
    #[error("Invalid annotation category: {0}")]
    InvalidAnnotation(String),

    /// 持久化失败；整轮效果已回滚，可重放
    #[error("Persistence failed: {0}")]
    Persistence(String),

    /// 未知学习者
    #[error("Unknown learner: {0}")]
    UnknownLearner(String),

    /// 同一学习者的并发写冲突（仅当轮失败，丢弃后从最近一致状态继续）
    #[error("Session conflict for learner {0}")]
    SessionConflict(String),

    /// 课程表缺失或损坏
    #[error("Curriculum error: {0}")]
    Curriculum(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}
