//! 辅导流程集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use profe::config::AppConfig;
    use profe::context::ContextAssembler;
    use profe::llm::{DetectionOutcome, MockLlmClient, ScriptedDetector};
    use profe::model::{
        AnnotationCandidate, CorrectionDirective, ErrorCategory, Speaker, Turn,
    };
    use profe::session::TutorEngine;
    use profe::store::TutorStore;

    fn fast_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.max_retries = 0;
        cfg.llm.request_timeout_secs = 5;
        cfg
    }

    fn nonfinite_candidate() -> DetectionOutcome {
        DetectionOutcome {
            candidates: vec![AnnotationCandidate {
                category: ErrorCategory::NonFiniteVerbForm,
                surface_text: "y nadar mucho".to_string(),
                corrected_text: "y nadé mucho".to_string(),
                explanation: "tras el pretérito, el segundo verbo también se conjuga".to_string(),
            }],
            emotionally_charged: false,
        }
    }

    #[tokio::test]
    async fn test_third_occurrence_escalates_to_explicit() {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        let engine = TutorEngine::new(
            fast_config(),
            store.clone(),
            Arc::new(MockLlmClient::new()),
            Arc::new(ScriptedDetector::new(vec![
                nonfinite_candidate(),
                nonfinite_candidate(),
                nonfinite_candidate(),
            ])),
        );

        let text = "yo fui a la playa y nadar mucho";
        let first = engine.learner_turn("ana", "Ana", text, Utc::now()).await.unwrap();
        let second = engine.learner_turn("ana", "Ana", text, Utc::now()).await.unwrap();
        let third = engine.learner_turn("ana", "Ana", text, Utc::now()).await.unwrap();

        assert!(matches!(first.directive, CorrectionDirective::Implicit(_)));
        assert!(matches!(second.directive, CorrectionDirective::Implicit(_)));
        assert!(matches!(third.directive, CorrectionDirective::Explicit(_)));

        // 该分类的序列号严格递增无空洞，第三次为 3
        let annotations = store
            .annotations_since("ana", Utc::now() - Duration::days(1))
            .await
            .unwrap();
        let mut seqs: Vec<u64> = annotations
            .iter()
            .filter(|a| a.category == ErrorCategory::NonFiniteVerbForm)
            .map(|a| a.seq)
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_two_learners_never_corrupt_each_other() {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        let engine = Arc::new(TutorEngine::new(
            fast_config(),
            store.clone(),
            Arc::new(MockLlmClient::new()),
            Arc::new(ScriptedDetector::new(Vec::new())),
        ));

        let mut handles = Vec::new();
        for learner in ["ana", "luis"] {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..5 {
                    engine
                        .learner_turn(learner, learner, &format!("mensaje {i} de {learner}"), Utc::now())
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // 每个学习者恰好 5 轮入站 + 5 轮回复，与串行执行一致
        assert_eq!(store.count_turns("ana").await.unwrap(), 10);
        assert_eq!(store.count_turns("luis").await.unwrap(), 10);
        let ana_turns = store
            .turns_since("ana", Utc::now() - Duration::days(1))
            .await
            .unwrap();
        assert!(ana_turns.iter().all(|t| t.learner_id == "ana"));
    }

    #[tokio::test]
    async fn test_stale_turns_stay_queryable_but_out_of_context() {
        let store = Arc::new(TutorStore::in_memory().unwrap());
        store.get_or_create_profile("ana", "Ana", "UTC", 0).await.unwrap();

        let now = Utc::now();
        let mut stale = Turn::new("ana", Speaker::Learner, "mensaje de hace seis semanas", 0);
        stale.created_at = now - Duration::days(42);
        store.append_turn(&stale).await.unwrap();
        let fresh = Turn::new("ana", Speaker::Learner, "mensaje de hoy", 0);
        store.append_turn(&fresh).await.unwrap();

        let cfg = AppConfig::default();
        let assembler = ContextAssembler::new(store.clone(), cfg.app, cfg.review.due_cards_cap);
        let bundle = assembler
            .build("ana", now, String::new(), CorrectionDirective::None, Vec::new())
            .await
            .unwrap();

        assert_eq!(bundle.turns.len(), 1);
        assert_eq!(bundle.turns[0].text, "mensaje de hoy");
        assert_eq!(store.count_turns("ana").await.unwrap(), 2);
    }
}
