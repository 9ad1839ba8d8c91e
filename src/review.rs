//! 词汇复习调度：SM-2 间隔重复
//!
//! 卡片状态机：质量分 < 3 时连击清零、间隔回到 1 天（易度不变）；
//! 否则前两次用固定间隔 1 / 6 天，此后 间隔 × 易度，易度按标准公式更新、下限 1.3。
//! 间隔 ≥ 60 天且连击 ≥ 5 的卡片「毕业」，不再进入复习队列但保留历史。
//! 另含闪卡复习会话管理（每学习者至多一个活跃会话，超时自动清理）。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use tokio::sync::RwLock;

use crate::config::ReviewSection;
use crate::error::EngineError;
use crate::model::{LearnerId, VocabularyCard};
use crate::store::TutorStore;

/// 易度因子下限
pub const MIN_EASE: f64 = 1.3;
/// 新卡片初始易度
pub const INITIAL_EASE: f64 = 2.5;

/// 词汇复习调度器
pub struct ReviewScheduler {
    store: Arc<TutorStore>,
    cfg: ReviewSection,
}

impl ReviewScheduler {
    pub fn new(store: Arc<TutorStore>, cfg: ReviewSection) -> Self {
        Self { store, cfg }
    }

    /// 首次接触新词时建卡：间隔 1 天、易度 2.5、连击 0，次日到期
    ///
    /// (learner, word) 已有卡片时为幂等空操作，返回 false。
    pub async fn introduce(
        &self,
        learner_id: &str,
        word: &str,
        translation: Option<&str>,
        example: Option<&str>,
        unit_index: u32,
        today: NaiveDate,
    ) -> Result<bool, EngineError> {
        let card = VocabularyCard {
            learner_id: learner_id.to_string(),
            word: word.to_string(),
            translation: translation.map(String::from),
            example: example.map(String::from),
            introduced_unit: unit_index,
            introduced_at: Utc::now(),
            ease_factor: INITIAL_EASE,
            interval_days: 1,
            repetition_count: 0,
            next_review: today + Duration::days(1),
            last_review: None,
            successful_uses: 0,
            graduated: false,
        };
        self.store.introduce_card(&card).await
    }

    /// 复习一次后的新卡片状态（纯函数，由调用方决定提交时机）
    pub fn plan_review(&self, card: &VocabularyCard, quality: u8, today: NaiveDate) -> VocabularyCard {
        let quality = quality.min(5);
        let mut next = card.clone();

        if quality < 3 {
            // 失败复位是幂等的：无论之前状态如何都回到同一点
            next.repetition_count = 0;
            next.interval_days = 1;
        } else {
            next.repetition_count = card.repetition_count + 1;
            next.interval_days = match next.repetition_count {
                1 => 1,
                2 => 6,
                _ => ((card.interval_days as f64) * card.ease_factor).round().max(1.0) as u32,
            };
            let q = quality as f64;
            next.ease_factor =
                (card.ease_factor + (0.1 - (5.0 - q) * (0.08 + (5.0 - q) * 0.02))).max(MIN_EASE);
        }

        next.next_review = today + Duration::days(next.interval_days as i64);
        next.last_review = Some(today);

        if next.interval_days >= self.cfg.graduation_interval_days
            && next.repetition_count >= self.cfg.graduation_repetitions
        {
            next.graduated = true;
        }
        next
    }

    /// 学习者在对话中正确用到卡片词：成功使用 +1，按质量 4 推进调度
    pub fn plan_usage(&self, card: &VocabularyCard, today: NaiveDate) -> VocabularyCard {
        let mut next = self.plan_review(card, 4, today);
        next.successful_uses = card.successful_uses + 1;
        next
    }

    /// 复习一次并立即持久化（闪卡会话路径，不经过轮次事务）
    pub async fn update(
        &self,
        learner_id: &str,
        word: &str,
        quality: u8,
        today: NaiveDate,
    ) -> Result<Option<VocabularyCard>, EngineError> {
        let Some(card) = self.store.get_card(learner_id, word).await? else {
            return Ok(None);
        };
        let next = self.plan_review(&card, quality, today);
        let mut effects = crate::store::TurnEffects::new(learner_id);
        effects.card_upserts.push(next.clone());
        self.store.apply_turn_effects(&effects).await?;
        Ok(Some(next))
    }

    /// 截至 as_of 到期的卡片（毕业卡除外），最弱的先出，容量受配置上限约束
    pub async fn due_cards(
        &self,
        learner_id: &str,
        as_of: NaiveDate,
    ) -> Result<Vec<VocabularyCard>, EngineError> {
        self.store.due_cards(learner_id, as_of, self.cfg.due_cards_cap).await
    }

    pub fn session_timeout(&self) -> chrono::Duration {
        Duration::minutes(self.cfg.session_timeout_minutes)
    }
}

/// 一次活跃的闪卡复习会话
#[derive(Debug, Clone)]
pub struct ReviewSession {
    pub learner_id: LearnerId,
    pub cards: Vec<VocabularyCard>,
    pub current_index: usize,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl ReviewSession {
    fn new(learner_id: LearnerId, cards: Vec<VocabularyCard>) -> Self {
        let now = Utc::now();
        Self {
            learner_id,
            cards,
            current_index: 0,
            started_at: now,
            last_activity: now,
        }
    }

    /// 正在复习的卡片；全部完成时为 None
    pub fn current_card(&self) -> Option<&VocabularyCard> {
        self.cards.get(self.current_index)
    }

    pub fn is_complete(&self) -> bool {
        self.current_index >= self.cards.len()
    }

    pub fn cards_remaining(&self) -> usize {
        self.cards.len().saturating_sub(self.current_index)
    }

    /// 翻到下一张并刷新活跃时间
    pub fn advance(&mut self) {
        self.current_index += 1;
        self.last_activity = Utc::now();
    }

    pub fn is_inactive(&self, timeout: chrono::Duration) -> bool {
        Utc::now() - self.last_activity > timeout
    }
}

/// 复习会话管理器：每学习者至多一个活跃会话
pub struct ReviewSessionManager {
    sessions: RwLock<HashMap<LearnerId, ReviewSession>>,
}

impl ReviewSessionManager {
    pub fn new() -> Self {
        Self { sessions: RwLock::new(HashMap::new()) }
    }

    /// 开始新会话（替换同一学习者的旧会话）
    pub async fn create_session(&self, learner_id: &str, cards: Vec<VocabularyCard>) -> ReviewSession {
        let session = ReviewSession::new(learner_id.to_string(), cards);
        tracing::info!(learner_id, cards = session.cards.len(), "Created review session");
        self.sessions
            .write()
            .await
            .insert(learner_id.to_string(), session.clone());
        session
    }

    pub async fn has_active_session(&self, learner_id: &str) -> bool {
        self.sessions.read().await.contains_key(learner_id)
    }

    /// 读取会话快照
    pub async fn get_session(&self, learner_id: &str) -> Option<ReviewSession> {
        self.sessions.read().await.get(learner_id).cloned()
    }

    /// 对当前会话执行可变操作（翻卡等）
    pub async fn with_session<F, R>(&self, learner_id: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut ReviewSession) -> R,
    {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(learner_id).map(f)
    }

    /// 结束并移除会话，返回会话数据
    pub async fn end_session(&self, learner_id: &str) -> Option<ReviewSession> {
        self.sessions.write().await.remove(learner_id)
    }

    /// 清理不活跃会话，返回被清理的学习者列表
    pub async fn cleanup_inactive(&self, timeout: chrono::Duration) -> Vec<LearnerId> {
        let mut sessions = self.sessions.write().await;
        let inactive: Vec<LearnerId> = sessions
            .iter()
            .filter(|(_, s)| s.is_inactive(timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for learner_id in &inactive {
            sessions.remove(learner_id);
            tracing::info!(learner_id, "Cleaned up inactive review session");
        }
        inactive
    }
}

impl Default for ReviewSessionManager {
    fn default() -> Self {
        Self::new()
    }
}
