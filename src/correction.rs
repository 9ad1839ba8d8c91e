//! 纠错追踪：按分类聚合错误并决定纠正策略
//!
//! 每个 (learner, category) 维护严格递增且无空洞的出现序列号。
//! 策略升降级：同一分类在留存窗口内出现达到阈值（默认 3）后升为显式纠正；
//! 显式状态下连续正确使用达到阈值（默认 2）则降回隐式，并从降级点重新计数
//! （序列号本身永不回退）。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::CorrectionSection;
use crate::error::EngineError;
use crate::model::{AnnotationCandidate, CorrectionDirective, ErrorAnnotation, ErrorCategory};
use crate::store::TutorStore;

/// 单个分类的升降级状态（持久化于 correction_state 表）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategoryState {
    /// 已分配的最大序列号（无空洞计数的来源）
    pub last_seq: u64,
    /// 当前是否处于显式纠正状态
    pub escalated: bool,
    /// 显式状态下连续正确使用的次数
    pub consecutive_correct: u32,
    /// 最近一次降级时的序列号；升级判定只数此后出现的次数
    pub demoted_base: u64,
}

/// 一轮的纠错计划：指令 + 待持久化的标注与状态（由 TurnEffects 原子提交）
#[derive(Debug)]
pub struct TurnCorrectionPlan {
    pub directive: CorrectionDirective,
    pub annotations: Vec<ErrorAnnotation>,
    pub category_states: Vec<(ErrorCategory, CategoryState)>,
}

/// 纠错追踪器
pub struct ErrorTracker {
    store: Arc<TutorStore>,
    cfg: CorrectionSection,
    retention_days: i64,
}

impl ErrorTracker {
    pub fn new(store: Arc<TutorStore>, cfg: CorrectionSection, retention_days: i64) -> Self {
        Self { store, cfg, retention_days }
    }

    /// 摄入本轮候选标注并决定纠正策略
    ///
    /// 只读阶段：返回的标注与状态由调用方随本轮其余效果一并原子提交。
    /// 只对学习者轮次调用；无候选时也要调用，以推进显式分类的正确使用计数。
    pub async fn plan_turn(
        &self,
        learner_id: &str,
        turn_id: &str,
        candidates: Vec<AnnotationCandidate>,
        emotionally_charged: bool,
        now: DateTime<Utc>,
    ) -> Result<TurnCorrectionPlan, EngineError> {
        let window_start = now - Duration::days(self.retention_days);
        let states = self.store.category_states(learner_id).await?;
        let prior = self.store.annotations_since(learner_id, window_start).await?;

        // 留存窗口内、降级点之后的既有出现次数
        let mut window_counts: HashMap<ErrorCategory, u64> = HashMap::new();
        for annotation in &prior {
            let base = states.get(&annotation.category).map(|s| s.demoted_base).unwrap_or(0);
            if annotation.seq > base {
                *window_counts.entry(annotation.category).or_default() += 1;
            }
        }

        let mut touched: HashMap<ErrorCategory, CategoryState> = HashMap::new();
        let mut annotations = Vec::with_capacity(candidates.len());
        let mut seen_this_turn: HashMap<ErrorCategory, u64> = HashMap::new();

        for candidate in &candidates {
            let state = touched
                .entry(candidate.category)
                .or_insert_with(|| states.get(&candidate.category).copied().unwrap_or_default());
            state.last_seq += 1;
            // 任何新出现都打断正确使用的连击
            state.consecutive_correct = 0;
            *seen_this_turn.entry(candidate.category).or_default() += 1;

            annotations.push(ErrorAnnotation {
                turn_id: turn_id.to_string(),
                learner_id: learner_id.to_string(),
                category: candidate.category,
                surface_text: candidate.surface_text.clone(),
                corrected_text: candidate.corrected_text.clone(),
                explanation: candidate.explanation.clone(),
                seq: state.last_seq,
                created_at: now,
            });
        }

        // 升级判定：窗口内（降级点之后）的累计出现次数达到阈值
        for (category, occurred) in &seen_this_turn {
            let total = window_counts.get(category).copied().unwrap_or(0) + occurred;
            if total >= self.cfg.explicit_after {
                if let Some(state) = touched.get_mut(category) {
                    state.escalated = true;
                }
            }
        }

        // 本轮通过检测且未再犯的显式分类：正确使用连击 +1，达到阈值则降级
        for (category, state) in states.iter() {
            if state.escalated && !seen_this_turn.contains_key(category) {
                let entry = touched.entry(*category).or_insert(*state);
                entry.consecutive_correct += 1;
                if entry.consecutive_correct >= self.cfg.demote_after_correct {
                    tracing::info!(learner_id, category = %category, "Demoting category back to implicit");
                    entry.escalated = false;
                    entry.demoted_base = entry.last_seq;
                    entry.consecutive_correct = 0;
                }
            }
        }

        let directive = self.choose_directive(&candidates, &touched, &window_counts, emotionally_charged);

        Ok(TurnCorrectionPlan {
            directive,
            annotations,
            category_states: touched.into_iter().collect(),
        })
    }

    /// 按优先级选出本轮要纠正的候选并定级
    ///
    /// 优先级：阻碍交流的分类在前；并列时历史出现次数最少的在前
    /// （新错误先于反复讲过的错误浮出）。
    fn choose_directive(
        &self,
        candidates: &[AnnotationCandidate],
        touched: &HashMap<ErrorCategory, CategoryState>,
        window_counts: &HashMap<ErrorCategory, u64>,
        emotionally_charged: bool,
    ) -> CorrectionDirective {
        if candidates.is_empty() {
            return CorrectionDirective::None;
        }
        // 情绪化轮次抑制纠正；标注仍然入库，只是本轮不指示纠正
        if emotionally_charged {
            return CorrectionDirective::None;
        }

        let mut ranked: Vec<&AnnotationCandidate> = candidates.iter().collect();
        ranked.sort_by_key(|c| {
            (
                !c.category.blocks_communication(),
                window_counts.get(&c.category).copied().unwrap_or(0),
            )
        });
        let chosen: Vec<AnnotationCandidate> = ranked
            .into_iter()
            .take(self.cfg.max_per_turn)
            .cloned()
            .collect();

        let any_escalated = chosen
            .iter()
            .any(|c| touched.get(&c.category).map(|s| s.escalated).unwrap_or(false));

        if any_escalated {
            CorrectionDirective::Explicit(chosen)
        } else {
            CorrectionDirective::Implicit(chosen)
        }
    }

    /// 窗口内出现次数最多的 n 个分类（Extend 时的定向练习目标）
    pub async fn weakest_categories(
        &self,
        learner_id: &str,
        now: DateTime<Utc>,
        n: usize,
    ) -> Result<Vec<ErrorCategory>, EngineError> {
        let window_start = now - Duration::days(self.retention_days);
        let counts = self.store.occurrence_counts(learner_id, window_start).await?;
        let mut ranked: Vec<(ErrorCategory, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        Ok(ranked.into_iter().take(n).map(|(c, _)| c).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TurnEffects;

    fn candidate(category: ErrorCategory) -> AnnotationCandidate {
        AnnotationCandidate {
            category,
            surface_text: "y nadar mucho".to_string(),
            corrected_text: "y nadé mucho".to_string(),
            explanation: "Después de 'y' se usa el pretérito, no el infinitivo".to_string(),
        }
    }

    async fn setup() -> (Arc<TutorStore>, ErrorTracker) {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        store.get_or_create_profile("ana", "Ana", "UTC", 0).await.unwrap();
        let tracker = ErrorTracker::new(store.clone(), CorrectionSection::default(), 30);
        (store, tracker)
    }

    async fn commit(store: &TutorStore, plan: TurnCorrectionPlan) {
        let learner = plan
            .annotations
            .first()
            .map(|a| a.learner_id.clone())
            .unwrap_or_else(|| "ana".to_string());
        let mut effects = TurnEffects::new(learner);
        effects.annotations = plan.annotations;
        effects.category_states = plan.category_states;
        store.apply_turn_effects(&effects).await.unwrap();
    }

    #[tokio::test]
    async fn test_third_occurrence_escalates_to_explicit() {
        let (store, tracker) = setup().await;
        let cat = ErrorCategory::NonFiniteVerbForm;

        for (i, expect_explicit) in [(1u64, false), (2, false), (3, true)] {
            let plan = tracker
                .plan_turn("ana", &format!("turn_{i}"), vec![candidate(cat)], false, Utc::now())
                .await
                .unwrap();
            assert_eq!(plan.annotations.len(), 1);
            assert_eq!(plan.annotations[0].seq, i);
            match (&plan.directive, expect_explicit) {
                (CorrectionDirective::Implicit(_), false) | (CorrectionDirective::Explicit(_), true) => {}
                other => panic!("turn {i}: unexpected directive {other:?}"),
            }
            commit(&store, plan).await;
        }
    }

    #[tokio::test]
    async fn test_two_correct_uses_demote_to_implicit() {
        let (store, tracker) = setup().await;
        let cat = ErrorCategory::SerEstar;

        for i in 1..=3u64 {
            let plan = tracker
                .plan_turn("ana", &format!("turn_{i}"), vec![candidate(cat)], false, Utc::now())
                .await
                .unwrap();
            commit(&store, plan).await;
        }

        // 两轮干净的检测推进连击并触发降级
        for i in 4..=5u64 {
            let plan = tracker
                .plan_turn("ana", &format!("turn_{i}"), vec![], false, Utc::now())
                .await
                .unwrap();
            assert!(plan.directive.is_none());
            commit(&store, plan).await;
        }
        let states = store.category_states("ana").await.unwrap();
        let state = states.get(&cat).unwrap();
        assert!(!state.escalated);
        assert_eq!(state.demoted_base, 3);

        // 降级后再犯：从降级点重新计数，策略回到隐式；序列号继续递增
        let plan = tracker
            .plan_turn("ana", "turn_6", vec![candidate(cat)], false, Utc::now())
            .await
            .unwrap();
        assert!(matches!(plan.directive, CorrectionDirective::Implicit(_)));
        assert_eq!(plan.annotations[0].seq, 4);
    }

    #[tokio::test]
    async fn test_priority_blocking_first_then_novel() {
        let (store, tracker) = setup().await;

        // 历史上 preposition 已出现过一次
        let plan = tracker
            .plan_turn("ana", "turn_1", vec![candidate(ErrorCategory::Preposition)], false, Utc::now())
            .await
            .unwrap();
        commit(&store, plan).await;

        // 本轮三类并发，上限 2：阻碍交流的 word_order 优先，
        // 其余并列时取历史次数更少的 gender_agreement
        let plan = tracker
            .plan_turn(
                "ana",
                "turn_2",
                vec![
                    candidate(ErrorCategory::Preposition),
                    candidate(ErrorCategory::WordOrder),
                    candidate(ErrorCategory::GenderAgreement),
                ],
                false,
                Utc::now(),
            )
            .await
            .unwrap();
        match &plan.directive {
            CorrectionDirective::Implicit(chosen) => {
                assert_eq!(chosen.len(), 2);
                assert_eq!(chosen[0].category, ErrorCategory::WordOrder);
                assert_eq!(chosen[1].category, ErrorCategory::GenderAgreement);
            }
            other => panic!("unexpected directive {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_emotionally_charged_turn_suppresses_directive() {
        let (store, tracker) = setup().await;
        let plan = tracker
            .plan_turn("ana", "turn_1", vec![candidate(ErrorCategory::Preposition)], true, Utc::now())
            .await
            .unwrap();
        assert!(plan.directive.is_none());
        // 标注仍然入库，统计保持真实
        assert_eq!(plan.annotations.len(), 1);
        commit(&store, plan).await;
        let counts = store
            .occurrence_counts("ana", Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert_eq!(counts.get(&ErrorCategory::Preposition), Some(&1));
    }

    #[tokio::test]
    async fn test_sequence_numbers_gapless_per_category() {
        let (store, tracker) = setup().await;
        for i in 1..=4u64 {
            let plan = tracker
                .plan_turn(
                    "ana",
                    &format!("turn_{i}"),
                    vec![candidate(ErrorCategory::VerbConjugation), candidate(ErrorCategory::Preposition)],
                    false,
                    Utc::now(),
                )
                .await
                .unwrap();
            commit(&store, plan).await;
        }
        let annotations = store
            .annotations_since("ana", Utc::now() - Duration::days(1))
            .await
            .unwrap();
        let mut verb_seqs: Vec<u64> = annotations
            .iter()
            .filter(|a| a.category == ErrorCategory::VerbConjugation)
            .map(|a| a.seq)
            .collect();
        verb_seqs.sort_unstable();
        assert_eq!(verb_seqs, vec![1, 2, 3, 4]);
    }
}
