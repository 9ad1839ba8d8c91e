//! 能力评分：滑动窗口上的加权合成分
//!
//! 五个子分各自归一化到 [0,1] 后按权重合成，结果再截断到 [0,1]。
//! 各子分在其声明方向上单调（固定其余子分时），这是可测试性的硬约束。
//! 系统轮次不计入任何统计；语法复杂度用标记词启发式，不做语法分析。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::ProficiencySection;
use crate::error::EngineError;
use crate::model::{ComponentScores, ErrorAnnotation, ProficiencySnapshot, Speaker, Turn};
use crate::store::TutorStore;

/// 从句 / 虚拟式标记词（小写匹配）
const COMPLEXITY_MARKERS: &[&str] = &[
    "que", "porque", "cuando", "aunque", "mientras", "para que", "antes de que",
    "ojalá", "quisiera", "hubiera", "fuera", "pudiera", "tuviera",
];

/// 平均轮长的归一化基准（词数）：达到此长度视为满分
const DEPTH_LENGTH_NORM: f64 = 25.0;

/// 能力评分器
pub struct ProficiencyScorer {
    store: Arc<TutorStore>,
    cfg: ProficiencySection,
}

impl ProficiencyScorer {
    pub fn new(store: Arc<TutorStore>, cfg: ProficiencySection) -> Self {
        Self { store, cfg }
    }

    /// 重算当前能力快照（不落盘；随本轮效果原子提交）
    pub async fn recompute(
        &self,
        learner_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProficiencySnapshot, EngineError> {
        let window_start = now - Duration::days(self.cfg.window_days);
        let turns = self.store.turns_since(learner_id, window_start).await?;
        let annotations = self.store.annotations_since(learner_id, window_start).await?;

        let components = score_components(&turns, &annotations, window_start, now);
        let composite = compose(&self.cfg, &components);

        Ok(ProficiencySnapshot {
            learner_id: learner_id.to_string(),
            created_at: now,
            composite,
            components,
        })
    }
}

/// 由窗口内的轮次与标注计算各子分
pub fn score_components(
    turns: &[Turn],
    annotations: &[ErrorAnnotation],
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ComponentScores {
    let learner_turns: Vec<&Turn> = turns
        .iter()
        .filter(|t| t.speaker == Speaker::Learner)
        .collect();

    ComponentScores {
        error_trend: score_error_trend(&learner_turns, annotations, window_start, now),
        vocab_diversity: score_vocab_diversity(&learner_turns),
        grammar_complexity: score_grammar_complexity(&learner_turns),
        depth: score_depth(&learner_turns),
        engagement: score_engagement(&learner_turns, window_start, now),
    }
}

/// 加权合成并截断到 [0,1]
pub fn compose(cfg: &ProficiencySection, c: &ComponentScores) -> f64 {
    let composite = cfg.weight_error_trend * clamp01(c.error_trend)
        + cfg.weight_vocab_diversity * clamp01(c.vocab_diversity)
        + cfg.weight_grammar_complexity * clamp01(c.grammar_complexity)
        + cfg.weight_depth * clamp01(c.depth)
        + cfg.weight_engagement * clamp01(c.engagement);
    clamp01(composite)
}

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// 错误率趋势：窗口前半段与后半段的每轮错误率之差，下降得高分
fn score_error_trend(
    learner_turns: &[&Turn],
    annotations: &[ErrorAnnotation],
    window_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if learner_turns.is_empty() {
        return 0.5;
    }
    let midpoint = window_start + (now - window_start) / 2;

    let (mut early_turns, mut late_turns) = (0u32, 0u32);
    for turn in learner_turns {
        if turn.created_at < midpoint {
            early_turns += 1;
        } else {
            late_turns += 1;
        }
    }
    let (mut early_errors, mut late_errors) = (0u32, 0u32);
    for annotation in annotations {
        if annotation.created_at < midpoint {
            early_errors += 1;
        } else {
            late_errors += 1;
        }
    }

    let rate = |errors: u32, turns: u32| {
        if turns == 0 { 0.0 } else { errors as f64 / turns as f64 }
    };
    // 全部活动落在一个半区时，用该半区的绝对错误率反推（无趋势可比）
    if early_turns == 0 || late_turns == 0 {
        let total_rate = rate(early_errors + late_errors, early_turns + late_turns);
        return clamp01(1.0 - total_rate / 2.0);
    }
    clamp01(0.5 + (rate(early_errors, early_turns) - rate(late_errors, late_turns)) / 2.0)
}

/// 词汇多样性：去重词项 / 总词项
fn score_vocab_diversity(learner_turns: &[&Turn]) -> f64 {
    let mut total = 0usize;
    let mut unique: HashSet<String> = HashSet::new();
    for turn in learner_turns {
        for word in tokenize(&turn.text) {
            total += 1;
            let _ = unique.insert(word);
        }
    }
    if total == 0 {
        return 0.0;
    }
    clamp01(unique.len() as f64 / total as f64)
}

/// 语法复杂度：含从句/虚拟式标记的轮次占比（×2 放大，占比过半即满分）
fn score_grammar_complexity(learner_turns: &[&Turn]) -> f64 {
    if learner_turns.is_empty() {
        return 0.0;
    }
    let marked = learner_turns
        .iter()
        .filter(|t| {
            let lower = t.text.to_lowercase();
            COMPLEXITY_MARKERS.iter().any(|m| lower.contains(m))
        })
        .count();
    clamp01(marked as f64 / learner_turns.len() as f64 * 2.0)
}

/// 会话深度：平均轮长（按 25 词归一）与追问率各占一半
fn score_depth(learner_turns: &[&Turn]) -> f64 {
    if learner_turns.is_empty() {
        return 0.0;
    }
    let total_words: usize = learner_turns.iter().map(|t| tokenize(&t.text).count()).sum();
    let mean_len = total_words as f64 / learner_turns.len() as f64;
    let length_score = clamp01(mean_len / DEPTH_LENGTH_NORM);

    let questions = learner_turns.iter().filter(|t| t.text.contains('?') || t.text.contains('¿')).count();
    let question_rate = questions as f64 / learner_turns.len() as f64;

    clamp01(0.5 * length_score + 0.5 * question_rate)
}

/// 参与度：窗口内的活跃天数占比
fn score_engagement(learner_turns: &[&Turn], window_start: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let window_days = ((now - window_start).num_days()).max(1);
    let active_days: HashSet<_> = learner_turns.iter().map(|t| t.created_at.date_naive()).collect();
    clamp01(active_days.len() as f64 / window_days as f64)
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Turn;

    fn turn_at(text: &str, at: DateTime<Utc>) -> Turn {
        let mut turn = Turn::new("ana", Speaker::Learner, text, 0);
        turn.created_at = at;
        turn
    }

    fn annotation_at(at: DateTime<Utc>) -> ErrorAnnotation {
        ErrorAnnotation {
            turn_id: "t".to_string(),
            learner_id: "ana".to_string(),
            category: crate::model::ErrorCategory::Preposition,
            surface_text: String::new(),
            corrected_text: String::new(),
            explanation: String::new(),
            seq: 1,
            created_at: at,
        }
    }

    #[test]
    fn test_composite_always_in_unit_interval() {
        let cfg = ProficiencySection::default();
        for raw in [-5.0, 0.0, 0.3, 1.0, 7.0] {
            let c = ComponentScores {
                error_trend: raw,
                vocab_diversity: raw,
                grammar_complexity: raw,
                depth: raw,
                engagement: raw,
            };
            let composite = compose(&cfg, &c);
            assert!((0.0..=1.0).contains(&composite), "composite {composite} out of range");
        }
    }

    #[test]
    fn test_compose_monotonic_in_each_component() {
        let cfg = ProficiencySection::default();
        let base = ComponentScores {
            error_trend: 0.4,
            vocab_diversity: 0.4,
            grammar_complexity: 0.4,
            depth: 0.4,
            engagement: 0.4,
        };
        let low = compose(&cfg, &base);

        for field in 0..5 {
            let mut raised = base;
            match field {
                0 => raised.error_trend = 0.8,
                1 => raised.vocab_diversity = 0.8,
                2 => raised.grammar_complexity = 0.8,
                3 => raised.depth = 0.8,
                _ => raised.engagement = 0.8,
            }
            assert!(compose(&cfg, &raised) > low, "component {field} not monotonic");
        }
    }

    #[test]
    fn test_falling_error_rate_scores_higher() {
        let now = Utc::now();
        let window_start = now - Duration::days(14);
        let early = window_start + Duration::days(2);
        let late = now - Duration::days(2);

        let turns: Vec<Turn> = vec![turn_at("hola", early), turn_at("hola", late)];
        let refs: Vec<&Turn> = turns.iter().collect();

        // 错误集中在前半段（改善中）
        let improving = vec![annotation_at(early), annotation_at(early)];
        // 错误集中在后半段（恶化中）
        let worsening = vec![annotation_at(late), annotation_at(late)];

        let improving_score = score_error_trend(&refs, &improving, window_start, now);
        let worsening_score = score_error_trend(&refs, &worsening, window_start, now);
        assert!(improving_score > worsening_score);
        assert!(improving_score > 0.5);
        assert!(worsening_score < 0.5);
    }

    #[test]
    fn test_vocab_diversity_unique_over_total() {
        let now = Utc::now();
        let turns = vec![turn_at("la playa la playa", now)];
        let refs: Vec<&Turn> = turns.iter().collect();
        // 2 个去重词 / 4 个总词
        assert!((score_vocab_diversity(&refs) - 0.5).abs() < 1e-9);

        let varied = vec![turn_at("ayer fui al mercado nuevo", now)];
        let refs: Vec<&Turn> = varied.iter().collect();
        assert!((score_vocab_diversity(&refs) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_system_turns_excluded() {
        let now = Utc::now();
        let window_start = now - Duration::days(14);
        let mut system = Turn::new("ana", Speaker::System, "recordatorio diario", 0);
        system.created_at = now;
        let turns = vec![system];

        let components = score_components(&turns, &[], window_start, now);
        // 没有学习者轮次时各活动子分为零、趋势中性
        assert_eq!(components.vocab_diversity, 0.0);
        assert_eq!(components.depth, 0.0);
        assert_eq!(components.engagement, 0.0);
        assert_eq!(components.error_trend, 0.5);
    }

    #[tokio::test]
    async fn test_recompute_persistable_snapshot() {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        store.get_or_create_profile("ana", "Ana", "UTC", 0).await.unwrap();
        let turn = Turn::new("ana", Speaker::Learner, "creo que mañana iré a la playa porque hace sol", 0);
        store.append_turn(&turn).await.unwrap();

        let scorer = ProficiencyScorer::new(store.clone(), ProficiencySection::default());
        let snapshot = scorer.recompute("ana", Utc::now()).await.unwrap();
        assert!((0.0..=1.0).contains(&snapshot.composite));
        assert!(snapshot.components.grammar_complexity > 0.0);
    }
}
