//! 会话编排：每条入站消息驱动一次完整的辅导轮次
//!
//! 流程：入站落盘 → 错误检测 → 纠错计划 → 上下文组装 → 生成 →
//! 本轮效果原子提交（导师轮次、标注、卡片、快照、单元决策/转移）。
//! 同一学习者串行，不同学习者并行；生成调用期间不持有任何存储锁。
//! 生成失败重试退避后仍失败时返回降级回复，降级回复不落盘，
//! 学习者的入站轮次无论如何都已持久化以保住上下文连续性。

pub mod registry;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::context::{ContextAssembler, ContextBundle};
use crate::correction::{ErrorTracker, TurnCorrectionPlan};
use crate::curriculum::{mastery_estimate, CurriculumCatalog, CurriculumStateMachine};
use crate::error::EngineError;
use crate::llm::{ChatMessage, ErrorDetector, LlmClient};
use crate::model::{
    CorrectionDirective, ErrorCategory, Speaker, SystemTurnKind, Turn, UnitDecision,
    UnitDecisionRecord, UnitState, VocabularyCard,
};
use crate::proficiency::ProficiencyScorer;
use crate::review::{ReviewScheduler, ReviewSession, ReviewSessionManager};
use crate::session::registry::LearnerLocks;
use crate::store::{TurnEffects, TutorStore, UnitTransition};

/// 生成端不可用时的降级回复（不落盘）
const DEGRADED_REPLY: &str =
    "Perdona, ahora mismo no te puedo responder bien. ¿Lo intentamos de nuevo en un momento?";

/// 一轮的结果，交给传输层
#[derive(Debug)]
pub struct TurnOutcome {
    pub reply: String,
    /// 生成端耗尽重试后降级
    pub degraded: bool,
    /// 本轮做出的课程决策（Continue 不记录也不返回）
    pub decision: Option<UnitDecision>,
    /// 本轮采用的纠正策略
    pub directive: CorrectionDirective,
}

/// 辅导引擎：组件编排入口
pub struct TutorEngine {
    cfg: AppConfig,
    store: Arc<TutorStore>,
    llm: Arc<dyn LlmClient>,
    detector: Arc<dyn ErrorDetector>,
    tracker: ErrorTracker,
    scheduler: ReviewScheduler,
    scorer: ProficiencyScorer,
    curriculum: CurriculumStateMachine,
    assembler: ContextAssembler,
    locks: LearnerLocks,
    reviews: ReviewSessionManager,
}

impl TutorEngine {
    pub fn new(
        cfg: AppConfig,
        store: Arc<TutorStore>,
        llm: Arc<dyn LlmClient>,
        detector: Arc<dyn ErrorDetector>,
    ) -> Self {
        let catalog = CurriculumCatalog::load(cfg.curriculum.catalog_path.as_deref());
        Self {
            tracker: ErrorTracker::new(store.clone(), cfg.correction.clone(), cfg.app.retention_days),
            scheduler: ReviewScheduler::new(store.clone(), cfg.review.clone()),
            scorer: ProficiencyScorer::new(store.clone(), cfg.proficiency.clone()),
            curriculum: CurriculumStateMachine::new(catalog, cfg.curriculum.clone()),
            assembler: ContextAssembler::new(store.clone(), cfg.app.clone(), cfg.review.due_cards_cap),
            locks: LearnerLocks::new(),
            reviews: ReviewSessionManager::new(),
            store,
            llm,
            detector,
            cfg,
        }
    }

    /// 处理一条学习者消息，返回导师回复
    pub async fn learner_turn(
        &self,
        learner_id: &str,
        display_name: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome, EngineError> {
        let _guard = self.locks.acquire(learner_id).await;

        let created = self.store.get_profile(learner_id).await?.is_none();
        self.store
            .get_or_create_profile(learner_id, display_name, &self.cfg.app.default_timezone, 0)
            .await?;
        let unit_state = self.require_unit_state(learner_id).await?;
        if created {
            self.seed_unit_vocabulary(learner_id, unit_state.unit_index, now).await?;
        }

        self.store
            .prune_turns(now - chrono::Duration::days(self.cfg.app.retention_days))
            .await?;

        // 入站轮次无条件先落盘
        let inbound = Turn::new(learner_id, Speaker::Learner, text, unit_state.unit_index);
        self.store.append_turn(&inbound).await?;

        let detection = self
            .detector
            .detect(text, &self.cfg.app.level_tag)
            .await
            .unwrap_or_default();
        let plan = self
            .tracker
            .plan_turn(learner_id, &inbound.id, detection.candidates, detection.emotionally_charged, now)
            .await?;

        let reinforcement = self.pending_reinforcement(learner_id, &unit_state, now).await?;
        let bundle = self
            .assembler
            .build(
                learner_id,
                now,
                self.curriculum.catalog().lesson_goals(unit_state.unit_index),
                plan.directive.clone(),
                reinforcement,
            )
            .await?;

        let messages = self.to_messages(&bundle, display_name);
        let reply = match self.generate(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(learner_id, error = %e, "Generation exhausted retries, degrading");
                return Ok(TurnOutcome {
                    reply: DEGRADED_REPLY.to_string(),
                    degraded: true,
                    decision: None,
                    directive: plan.directive,
                });
            }
        };

        let outcome = self
            .commit_turn(learner_id, &unit_state, plan, &bundle, text, &reply, now)
            .await?;
        Ok(outcome)
    }

    /// 定时器触发的系统轮次（晨间问候、不活跃提醒、周报）
    ///
    /// 与学习者轮次同一入口与锁边界，但不计入错误/词汇统计，也不推进课程。
    pub async fn system_turn(
        &self,
        learner_id: &str,
        kind: SystemTurnKind,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome, EngineError> {
        let _guard = self.locks.acquire(learner_id).await;

        let Some(profile) = self.store.get_profile(learner_id).await? else {
            return Err(EngineError::UnknownLearner(learner_id.to_string()));
        };
        let unit_state = self.require_unit_state(learner_id).await?;

        let inbound = Turn::new(learner_id, Speaker::System, kind.prompt(), unit_state.unit_index);
        self.store.append_turn(&inbound).await?;

        let bundle = self
            .assembler
            .build(
                learner_id,
                now,
                self.curriculum.catalog().lesson_goals(unit_state.unit_index),
                CorrectionDirective::None,
                Vec::new(),
            )
            .await?;
        let messages = self.to_messages(&bundle, &profile.display_name);
        let reply = match self.generate(&messages).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(learner_id, error = %e, "System turn generation failed, skipping");
                return Ok(TurnOutcome {
                    reply: DEGRADED_REPLY.to_string(),
                    degraded: true,
                    decision: None,
                    directive: CorrectionDirective::None,
                });
            }
        };

        let mut effects = TurnEffects::new(learner_id);
        effects.tutor_turn = Some(Turn::new(learner_id, Speaker::Tutor, &reply, unit_state.unit_index));
        self.store.apply_turn_effects(&effects).await?;

        Ok(TurnOutcome {
            reply,
            degraded: false,
            decision: None,
            directive: CorrectionDirective::None,
        })
    }

    /// 学习者明确接受跳级邀约
    pub async fn accept_skip(&self, learner_id: &str, now: DateTime<Utc>) -> Result<bool, EngineError> {
        let _guard = self.locks.acquire(learner_id).await;
        let unit_state = self.require_unit_state(learner_id).await?;

        let Some(target) = self.curriculum.skip_target(&unit_state) else {
            return Ok(false);
        };
        let mut effects = TurnEffects::new(learner_id);
        effects.decision = Some(UnitDecisionRecord {
            decision: UnitDecision::Advance,
            mastery: unit_state.mastery,
            at: now,
        });
        effects.transition = Some(UnitTransition { to_unit: target, at: now });
        self.store.apply_turn_effects(&effects).await?;
        self.seed_unit_vocabulary(learner_id, target, now).await?;
        tracing::info!(learner_id, target, "Skip offer accepted");
        Ok(true)
    }

    /// 开始一次闪卡复习会话；无到期卡片时返回 None
    pub async fn start_review(
        &self,
        learner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ReviewSession>, EngineError> {
        self.reviews
            .cleanup_inactive(self.scheduler.session_timeout())
            .await;
        let due = self.scheduler.due_cards(learner_id, now.date_naive()).await?;
        if due.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.reviews.create_session(learner_id, due).await))
    }

    /// 给当前闪卡打分并翻到下一张；返回更新后的卡与剩余张数
    pub async fn grade_review(
        &self,
        learner_id: &str,
        quality: u8,
        now: DateTime<Utc>,
    ) -> Result<Option<(VocabularyCard, usize)>, EngineError> {
        let Some(word) = self
            .reviews
            .with_session(learner_id, |s| s.current_card().map(|c| c.word.clone()))
            .await
            .flatten()
        else {
            return Ok(None);
        };

        let updated = self.scheduler.update(learner_id, &word, quality, now.date_naive()).await?;
        let remaining = self
            .reviews
            .with_session(learner_id, |s| {
                s.advance();
                s.cards_remaining()
            })
            .await
            .unwrap_or(0);
        if remaining == 0 {
            self.reviews.end_session(learner_id).await;
        }
        Ok(updated.map(|card| (card, remaining)))
    }

    // ---------- 内部 ----------

    async fn require_unit_state(&self, learner_id: &str) -> Result<UnitState, EngineError> {
        self.store
            .active_unit_state(learner_id)
            .await?
            .ok_or_else(|| EngineError::Curriculum(format!("no active unit for {learner_id}")))
    }

    /// 上一周期 Extend 在案时，后续轮次携带最弱分类的强化指令
    async fn pending_reinforcement(
        &self,
        learner_id: &str,
        unit_state: &UnitState,
        now: DateTime<Utc>,
    ) -> Result<Vec<ErrorCategory>, EngineError> {
        let extend_pending = unit_state
            .decisions
            .last()
            .map(|d| d.decision == UnitDecision::Extend)
            .unwrap_or(false);
        if !extend_pending {
            return Ok(Vec::new());
        }
        self.tracker
            .weakest_categories(learner_id, now, self.cfg.curriculum.weakest_categories)
            .await
    }

    fn to_messages(&self, bundle: &ContextBundle, display_name: &str) -> Vec<ChatMessage> {
        let persona = format!(
            "Eres Profe, una profesora de español cercana y paciente. Conversas con {display_name} \
             (nivel {level}) de forma natural, en español, con respuestas breves de chat. \
             Sigue estas instrucciones de enseñanza:\n{directives}",
            display_name = display_name,
            level = self.cfg.app.level_tag,
            directives = bundle.directive_text(),
        );
        let mut messages = vec![ChatMessage::system(persona)];
        for turn in &bundle.turns {
            messages.push(match turn.speaker {
                Speaker::Learner => ChatMessage::user(turn.text.clone()),
                Speaker::Tutor => ChatMessage::assistant(turn.text.clone()),
                Speaker::System => ChatMessage::system(turn.text.clone()),
            });
        }
        messages
    }

    /// 带超时与指数退避的生成调用
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        let timeout = StdDuration::from_secs(self.cfg.llm.request_timeout_secs);
        let mut attempt = 0u32;
        loop {
            match tokio::time::timeout(timeout, self.llm.complete(messages)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "Generation request failed");
                }
                Err(_) => {
                    tracing::warn!(attempt, timeout_secs = self.cfg.llm.request_timeout_secs, "Generation request timed out");
                }
            }
            if attempt >= self.cfg.llm.max_retries {
                return Err(EngineError::GenerationTimeout(attempt + 1));
            }
            tokio::time::sleep(StdDuration::from_millis(500 * 2u64.pow(attempt.min(4)))).await;
            attempt += 1;
        }
    }

    /// 汇总本轮全部效果并原子提交
    #[allow(clippy::too_many_arguments)]
    async fn commit_turn(
        &self,
        learner_id: &str,
        unit_state: &UnitState,
        plan: TurnCorrectionPlan,
        bundle: &ContextBundle,
        learner_text: &str,
        reply: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnOutcome, EngineError> {
        let mut effects = TurnEffects::new(learner_id);
        effects.tutor_turn = Some(Turn::new(learner_id, Speaker::Tutor, reply, unit_state.unit_index));
        effects.annotations = plan.annotations;
        effects.category_states = plan.category_states;

        // 学习者主动用到了到期词：按成功使用推进其卡片
        let lowered = learner_text.to_lowercase();
        for card in &bundle.due_cards {
            if lowered.contains(&card.word.to_lowercase()) {
                effects.card_upserts.push(self.scheduler.plan_usage(card, now.date_naive()));
            }
        }

        let snapshot = self.scorer.recompute(learner_id, now).await?;
        let mut unit_snapshots = self.store.snapshots_since(learner_id, unit_state.entered_at).await?;
        unit_snapshots.push(snapshot.clone());
        let mastery = mastery_estimate(&unit_snapshots);
        effects.snapshot = Some(snapshot);
        effects.mastery = Some(mastery);

        let decision = self.curriculum.evaluate(unit_state, mastery, now);
        let transition_to =
            (decision == UnitDecision::Advance).then(|| unit_state.unit_index + 1);
        if decision != UnitDecision::Continue {
            effects.decision = Some(UnitDecisionRecord { decision, mastery, at: now });
        }
        if let Some(to_unit) = transition_to {
            effects.transition = Some(UnitTransition { to_unit, at: now });
            tracing::info!(learner_id, from = unit_state.unit_index, to_unit, mastery, "Unit advance");
        }

        let directive = bundle.directive.clone();
        self.store.apply_turn_effects(&effects).await?;

        if let Some(to_unit) = transition_to {
            self.seed_unit_vocabulary(learner_id, to_unit, now).await?;
        }

        Ok(TurnOutcome {
            reply: reply.to_string(),
            degraded: false,
            decision: (decision != UnitDecision::Continue).then_some(decision),
            directive,
        })
    }

    /// 进入新单元时把目录词汇建卡（已有卡片幂等跳过）
    async fn seed_unit_vocabulary(
        &self,
        learner_id: &str,
        unit_index: u32,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let words: Vec<(String, String, String)> = match self.curriculum.catalog().unit(unit_index) {
            Some(lesson) => lesson
                .vocabulary_words
                .iter()
                .map(|w| (w.word.clone(), w.translation.clone(), w.example.clone()))
                .collect(),
            None => return Ok(()),
        };
        for (word, translation, example) in words {
            self.scheduler
                .introduce(
                    learner_id,
                    &word,
                    Some(&translation).filter(|t| !t.is_empty()).map(|t| t.as_str()),
                    Some(&example).filter(|e| !e.is_empty()).map(|e| e.as_str()),
                    unit_index,
                    now.date_naive(),
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{DetectionOutcome, MockLlmClient, ScriptedDetector};
    use crate::model::{AnnotationCandidate, ErrorCategory};

    fn engine_with(
        llm: Arc<MockLlmClient>,
        outcomes: Vec<DetectionOutcome>,
    ) -> (TutorEngine, Arc<TutorStore>) {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        let mut cfg = AppConfig::default();
        cfg.llm.max_retries = 0;
        cfg.llm.request_timeout_secs = 5;
        let engine = TutorEngine::new(
            cfg,
            store.clone(),
            llm,
            Arc::new(ScriptedDetector::new(outcomes)),
        );
        (engine, store)
    }

    fn one_error() -> DetectionOutcome {
        DetectionOutcome {
            candidates: vec![AnnotationCandidate {
                category: ErrorCategory::SerEstar,
                surface_text: "soy cansado".to_string(),
                corrected_text: "estoy cansado".to_string(),
                explanation: "estado temporal con estar".to_string(),
            }],
            emotionally_charged: false,
        }
    }

    #[tokio::test]
    async fn test_turn_persists_exchange_and_annotations() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_reply("¡Claro! Descansa un poco.");
        let (engine, store) = engine_with(llm, vec![one_error()]);

        let outcome = engine
            .learner_turn("ana", "Ana", "hoy soy cansado", Utc::now())
            .await
            .unwrap();

        assert!(!outcome.degraded);
        assert_eq!(outcome.reply, "¡Claro! Descansa un poco.");
        assert!(matches!(outcome.directive, CorrectionDirective::Implicit(_)));
        // 学习者与导师轮次都在，标注也在
        assert_eq!(store.count_turns("ana").await.unwrap(), 2);
        let annotations = store
            .annotations_since("ana", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].seq, 1);
        // 快照已随本轮提交
        assert!(store.latest_snapshot("ana").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_generation_failure_degrades_without_tutor_turn() {
        let llm = Arc::new(MockLlmClient::new());
        llm.push_failure(crate::llm::LlmError::Api("boom".to_string()));
        let (engine, store) = engine_with(llm, vec![one_error()]);

        let outcome = engine
            .learner_turn("ana", "Ana", "hoy soy cansado", Utc::now())
            .await
            .unwrap();

        assert!(outcome.degraded);
        // 入站轮次保留，导师回复与标注都没有落盘
        assert_eq!(store.count_turns("ana").await.unwrap(), 1);
        let annotations = store
            .annotations_since("ana", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap();
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn test_system_turn_skips_statistics() {
        let llm = Arc::new(MockLlmClient::new());
        let (engine, store) = engine_with(llm, Vec::new());
        // 先建档
        engine.learner_turn("ana", "Ana", "hola", Utc::now()).await.unwrap();
        let turns_before = store.count_turns("ana").await.unwrap();
        let snapshots_before = store
            .snapshots_since("ana", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap()
            .len();

        let outcome = engine
            .system_turn("ana", SystemTurnKind::Morning, Utc::now())
            .await
            .unwrap();

        assert!(!outcome.degraded);
        assert_eq!(store.count_turns("ana").await.unwrap(), turns_before + 2);
        // 系统轮次不产生新的能力快照
        let snapshots_after = store
            .snapshots_since("ana", Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap()
            .len();
        assert_eq!(snapshots_after, snapshots_before);
    }

    #[tokio::test]
    async fn test_system_turn_unknown_learner() {
        let llm = Arc::new(MockLlmClient::new());
        let (engine, _store) = engine_with(llm, Vec::new());
        let result = engine.system_turn("nadie", SystemTurnKind::Morning, Utc::now()).await;
        assert!(matches!(result, Err(EngineError::UnknownLearner(_))));
    }

    #[tokio::test]
    async fn test_first_contact_seeds_unit_vocabulary() {
        let llm = Arc::new(MockLlmClient::new());
        let (engine, store) = engine_with(llm, Vec::new());
        engine.learner_turn("ana", "Ana", "hola", Utc::now()).await.unwrap();

        // 单元 0 的目录词建了卡
        let cards = store.all_cards("ana").await.unwrap();
        assert!(cards.iter().any(|c| c.word == "madrugar"));
        assert!(cards.iter().all(|c| c.introduced_unit == 0));
    }

    #[tokio::test]
    async fn test_review_session_round_trip() {
        let llm = Arc::new(MockLlmClient::new());
        let (engine, store) = engine_with(llm, Vec::new());
        let now = Utc::now();
        engine.learner_turn("ana", "Ana", "hola", now).await.unwrap();

        // 新卡次日才到期
        assert!(engine.start_review("ana", now).await.unwrap().is_none());

        let tomorrow = now + chrono::Duration::days(1);
        let session = engine.start_review("ana", tomorrow).await.unwrap().unwrap();
        assert!(!session.cards.is_empty());
        let total = session.cards.len();

        let (card, remaining) = engine.grade_review("ana", 5, tomorrow).await.unwrap().unwrap();
        assert_eq!(card.repetition_count, 1);
        assert_eq!(remaining, total - 1);

        let stats = store.mastery_stats("ana").await.unwrap();
        assert!(stats.total >= 2);
    }
}
