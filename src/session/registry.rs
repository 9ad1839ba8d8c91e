//! 每学习者互斥边界
//!
//! 同一学习者的轮次必须串行：出现计数、卡片状态与单元转移对乱序更新
//! 不可交换。不同学习者完全独立并行。锁在本轮全部效果落盘后才释放；
//! 网络调用期间不持有注册表级别的锁。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::model::LearnerId;

/// 学习者锁注册表
#[derive(Default)]
pub struct LearnerLocks {
    locks: RwLock<HashMap<LearnerId, Arc<Mutex<()>>>>,
}

impl LearnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取该学习者的轮次锁；持有期间同一学习者的其他轮次排队等待
    pub async fn acquire(&self, learner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let locks = self.locks.read().await;
            locks.get(learner_id).cloned()
        };
        let lock = match lock {
            Some(lock) => lock,
            None => {
                let mut locks = self.locks.write().await;
                locks
                    .entry(learner_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            }
        };
        lock.lock_owned().await
    }
}
