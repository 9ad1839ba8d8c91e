//! 上下文组装：喂给生成端的有界对话切片
//!
//! 取最近 N 轮或 token 预算先到为止（从最旧端裁剪），加当前单元教学目标、
//! 到期词卡与本轮纠错指令。只读，不产生任何副作用。

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::AppSection;
use crate::error::EngineError;
use crate::model::{CorrectionDirective, ErrorCategory, Turn, VocabularyCard};
use crate::store::TutorStore;

/// Token 估算器（字符计数近似）
///
/// ASCII 约 4 字符/token，非 ASCII（重音字母、标点等）约 1.5 字符/token。
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        (ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize).max(1)
    }
}

/// 交给生成端的完整上下文
#[derive(Debug, Clone)]
pub struct ContextBundle {
    /// 按时间正序（最旧在前）的对话切片
    pub turns: Vec<Turn>,
    /// 当前单元的教学目标文本
    pub teaching_goals: String,
    /// 到期待复习的词卡（封顶）
    pub due_cards: Vec<VocabularyCard>,
    /// 本轮纠错指令
    pub directive: CorrectionDirective,
    /// 保留指令携带的最弱分类（需要针对性强化时非空）
    pub reinforcement: Vec<ErrorCategory>,
}

impl ContextBundle {
    /// 拼出教学指令串（系统提示的一部分）
    pub fn directive_text(&self) -> String {
        let mut parts = vec![self.teaching_goals.clone()];

        if !self.due_cards.is_empty() {
            let words: Vec<&str> = self.due_cards.iter().map(|c| c.word.as_str()).collect();
            parts.push(format!(
                "Intenta que el estudiante use estas palabras de repaso: {}.",
                words.join(", "),
            ));
        }

        match &self.directive {
            CorrectionDirective::None => {}
            CorrectionDirective::Implicit(candidates) => {
                let fixes: Vec<String> = candidates
                    .iter()
                    .map(|c| format!("\"{}\" -> \"{}\"", c.surface_text, c.corrected_text))
                    .collect();
                parts.push(format!(
                    "Corrige de forma implícita, modelando la forma correcta sin señalar el error: {}.",
                    fixes.join("; "),
                ));
            }
            CorrectionDirective::Explicit(candidates) => {
                let fixes: Vec<String> = candidates
                    .iter()
                    .map(|c| {
                        format!(
                            "\"{}\" -> \"{}\" ({})",
                            c.surface_text, c.corrected_text, c.explanation,
                        )
                    })
                    .collect();
                parts.push(format!(
                    "Este error se repite: explícalo brevemente y con amabilidad: {}.",
                    fixes.join("; "),
                ));
            }
        }

        if !self.reinforcement.is_empty() {
            let names: Vec<&str> = self.reinforcement.iter().map(|c| c.as_str()).collect();
            parts.push(format!(
                "Refuerza con práctica dirigida estas áreas débiles: {}.",
                names.join(", "),
            ));
        }

        parts.join("\n")
    }
}

/// 上下文组装器
pub struct ContextAssembler {
    store: Arc<TutorStore>,
    cfg: AppSection,
    due_cards_cap: usize,
}

impl ContextAssembler {
    pub fn new(store: Arc<TutorStore>, cfg: AppSection, due_cards_cap: usize) -> Self {
        Self { store, cfg, due_cards_cap }
    }

    /// 组装一次上下文。教学目标与纠错指令由编排层传入，轮次与词卡从库里读。
    ///
    /// 早于保留窗口的轮次一律不进入上下文，即使尚未被剪枝。
    pub async fn build(
        &self,
        learner_id: &str,
        now: DateTime<Utc>,
        teaching_goals: String,
        directive: CorrectionDirective,
        reinforcement: Vec<ErrorCategory>,
    ) -> Result<ContextBundle, EngineError> {
        let retention_floor = now - Duration::days(self.cfg.retention_days);
        let mut turns = self
            .store
            .recent_turns(learner_id, retention_floor, self.cfg.max_context_turns)
            .await?;

        // token 预算先到则从最旧端继续裁剪
        let mut used: usize = turns.iter().map(|t| TokenEstimator::estimate(&t.text)).sum();
        while turns.len() > 1 && used > self.cfg.context_token_budget {
            let dropped = turns.remove(0);
            used -= TokenEstimator::estimate(&dropped.text);
        }

        let due_cards = self
            .store
            .due_cards(learner_id, now.date_naive(), self.due_cards_cap)
            .await?;

        Ok(ContextBundle { turns, teaching_goals, due_cards, directive, reinforcement })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Speaker;

    async fn seeded_store() -> Arc<TutorStore> {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        store.get_or_create_profile("ana", "Ana", "UTC", 0).await.unwrap();
        store
    }

    fn assembler(store: Arc<TutorStore>, cfg: AppSection) -> ContextAssembler {
        ContextAssembler::new(store, cfg, 5)
    }

    #[tokio::test]
    async fn test_turn_cap_keeps_newest_oldest_first() {
        let store = seeded_store().await;
        let now = Utc::now();
        for i in 0..30 {
            let mut turn = Turn::new("ana", Speaker::Learner, &format!("mensaje {i}"), 0);
            turn.created_at = now - Duration::minutes(30 - i);
            store.append_turn(&turn).await.unwrap();
        }

        let cfg = AppSection { max_context_turns: 20, ..AppSection::default() };
        let bundle = assembler(store, cfg)
            .build("ana", now, String::new(), CorrectionDirective::None, Vec::new())
            .await
            .unwrap();

        assert_eq!(bundle.turns.len(), 20);
        // 最旧在前，且保留的是最新的 20 条
        assert_eq!(bundle.turns[0].text, "mensaje 10");
        assert_eq!(bundle.turns[19].text, "mensaje 29");
    }

    #[tokio::test]
    async fn test_token_budget_binds_before_turn_cap() {
        let store = seeded_store().await;
        let now = Utc::now();
        let long_text = "palabra ".repeat(200);
        for i in 0..10 {
            let mut turn = Turn::new("ana", Speaker::Learner, &long_text, 0);
            turn.created_at = now - Duration::minutes(10 - i);
            store.append_turn(&turn).await.unwrap();
        }

        let cfg = AppSection {
            max_context_turns: 20,
            context_token_budget: 1000,
            ..AppSection::default()
        };
        let bundle = assembler(store, cfg)
            .build("ana", now, String::new(), CorrectionDirective::None, Vec::new())
            .await
            .unwrap();

        assert!(bundle.turns.len() < 10);
        let used: usize = bundle.turns.iter().map(|t| TokenEstimator::estimate(&t.text)).sum();
        assert!(used <= 1000);
    }

    #[tokio::test]
    async fn test_retention_window_excludes_old_turns() {
        let store = seeded_store().await;
        let now = Utc::now();
        let mut stale = Turn::new("ana", Speaker::Learner, "mensaje viejo", 0);
        stale.created_at = now - Duration::days(45);
        store.append_turn(&stale).await.unwrap();
        let mut fresh = Turn::new("ana", Speaker::Learner, "mensaje nuevo", 0);
        fresh.created_at = now - Duration::hours(1);
        store.append_turn(&fresh).await.unwrap();

        let bundle = assembler(store.clone(), AppSection::default())
            .build("ana", now, String::new(), CorrectionDirective::None, Vec::new())
            .await
            .unwrap();

        assert_eq!(bundle.turns.len(), 1);
        assert_eq!(bundle.turns[0].text, "mensaje nuevo");
        // 窗口外的轮次仍在长期存储中可查
        assert_eq!(store.count_turns("ana").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_directive_text_mentions_corrections_and_cards() {
        let bundle = ContextBundle {
            turns: Vec::new(),
            teaching_goals: "Unidad 2: pasado.".to_string(),
            due_cards: Vec::new(),
            directive: CorrectionDirective::Explicit(vec![crate::model::AnnotationCandidate {
                category: ErrorCategory::NonFiniteVerbForm,
                surface_text: "y nadar mucho".to_string(),
                corrected_text: "y nadé mucho".to_string(),
                explanation: "tras conjugar, el segundo verbo también se conjuga".to_string(),
            }]),
            reinforcement: vec![ErrorCategory::Preposition],
        };
        let text = bundle.directive_text();
        assert!(text.contains("Unidad 2"));
        assert!(text.contains("y nadé mucho"));
        assert!(text.contains("explícalo"));
        assert!(text.contains("preposition"));
    }

    #[test]
    fn test_token_estimator_ascii_and_accents() {
        assert!(TokenEstimator::estimate("hola") >= 1);
        let plain = TokenEstimator::estimate("aaaaaaaaaaaaaaaa");
        let accented = TokenEstimator::estimate("áááááááááááááááá");
        // 非 ASCII 字符按更高的 token 密度计
        assert!(accented > plain);
    }
}
