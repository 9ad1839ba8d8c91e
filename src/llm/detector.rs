//! 错误检测协作方
//!
//! 引擎把检测当黑盒：输入学习者原文与等级标签，输出零或多条候选标注
//! 加一个情绪标记。LLM 实现要求只返回 JSON；解析失败或请求失败时降级为
//! 空结果（记日志），绝不让检测问题中断本轮对话。

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{ChatMessage, LlmClient, LlmError};
use crate::model::{AnnotationCandidate, ErrorCategory};

/// 一次检测的结果
#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    pub candidates: Vec<AnnotationCandidate>,
    /// 情绪化轮次：本轮应抑制纠正
    pub emotionally_charged: bool,
}

/// 错误检测协作方 trait
#[async_trait]
pub trait ErrorDetector: Send + Sync {
    async fn detect(&self, text: &str, level_tag: &str) -> Result<DetectionOutcome, LlmError>;
}

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default)]
    emotionally_charged: bool,
    #[serde(default)]
    errors: Vec<RawCandidate>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    category: String,
    #[serde(default)]
    original_text: String,
    #[serde(default)]
    corrected_text: String,
    #[serde(default)]
    explanation: String,
}

/// LLM 驱动的检测器
pub struct LlmErrorDetector {
    client: Arc<dyn LlmClient>,
    max_candidates: usize,
}

impl LlmErrorDetector {
    pub fn new(client: Arc<dyn LlmClient>, max_candidates: usize) -> Self {
        Self { client, max_candidates }
    }

    fn system_prompt(&self, level_tag: &str) -> String {
        let categories: Vec<&str> = ErrorCategory::all().iter().map(|c| c.as_str()).collect();
        format!(
            "Eres una profesora de español que analiza el mensaje del estudiante (nivel {level}) \
             y devuelve SOLO un objeto JSON con los campos \"emotionally_charged\" (bool, true si \
             el mensaje expresa frustración o emoción fuerte) y \"errors\" (lista con como máximo \
             {max} elementos). Cada error debe incluir: \"category\" (uno de: {cats}), \
             \"original_text\", \"corrected_text\", \"explanation\".\n\n\
             IMPORTANTE: Solo identifica errores SIGNIFICATIVOS que impidan la comunicación o sean \
             fundamentales para el nivel {level}. Ignora:\n\
             - Errores menores de gramática que no afectan la comprensión\n\
             - Abreviaciones y lenguaje informal de texto (ej: 'q', 'tb', 'tmb')\n\
             - Pequeños errores de ortografía o acentos si el significado es claro\n\
             - Uso coloquial apropiado para chat",
            level = level_tag,
            max = self.max_candidates,
            cats = categories.join(", "),
        )
    }

    fn parse(&self, raw: &str) -> Result<DetectionOutcome, LlmError> {
        let cleaned = strip_code_fences(raw);
        // 模型偶尔只回裸数组
        let detection: RawDetection = if cleaned.starts_with('[') {
            RawDetection {
                emotionally_charged: false,
                errors: serde_json::from_str(cleaned)
                    .map_err(|e| LlmError::Malformed(e.to_string()))?,
            }
        } else {
            serde_json::from_str(cleaned).map_err(|e| LlmError::Malformed(e.to_string()))?
        };

        let mut candidates = Vec::new();
        for item in detection.errors.into_iter().take(self.max_candidates) {
            // 封闭分类体系之外的一律拒绝，防止体系漂移
            match ErrorCategory::parse(&item.category) {
                Some(category) => candidates.push(AnnotationCandidate {
                    category,
                    surface_text: item.original_text,
                    corrected_text: item.corrected_text,
                    explanation: item.explanation,
                }),
                None => {
                    tracing::warn!(category = %item.category, "Rejected annotation with unknown category");
                }
            }
        }
        Ok(DetectionOutcome { candidates, emotionally_charged: detection.emotionally_charged })
    }
}

#[async_trait]
impl ErrorDetector for LlmErrorDetector {
    async fn detect(&self, text: &str, level_tag: &str) -> Result<DetectionOutcome, LlmError> {
        if text.trim().is_empty() {
            return Ok(DetectionOutcome::default());
        }
        let messages = vec![
            ChatMessage::system(self.system_prompt(level_tag)),
            ChatMessage::user(format!(
                "Mensaje del estudiante:\n{text}\n\nSi no hay errores SIGNIFICATIVOS, devuelve \
                 {{\"emotionally_charged\": false, \"errors\": []}}.",
            )),
        ];

        let raw = match self.client.complete(&messages).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "Error detection call failed, continuing without annotations");
                return Ok(DetectionOutcome::default());
            }
        };
        match self.parse(&raw) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse detection payload, continuing without annotations");
                Ok(DetectionOutcome::default())
            }
        }
    }
}

/// 去掉模型可能包裹的 ``` 围栏与 "json" 语言提示
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    let inner = inner.trim_start();
    let inner = inner
        .strip_prefix("json")
        .or_else(|| inner.strip_prefix("JSON"))
        .unwrap_or(inner);
    inner.trim()
}

/// 脚本化检测器（测试用）：按顺序吐出预置结果，耗尽后返回空
#[derive(Debug, Default)]
pub struct ScriptedDetector {
    outcomes: Mutex<Vec<DetectionOutcome>>,
}

impl ScriptedDetector {
    pub fn new(mut outcomes: Vec<DetectionOutcome>) -> Self {
        outcomes.reverse();
        Self { outcomes: Mutex::new(outcomes) }
    }
}

#[async_trait]
impl ErrorDetector for ScriptedDetector {
    async fn detect(&self, _text: &str, _level_tag: &str) -> Result<DetectionOutcome, LlmError> {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            if let Some(outcome) = outcomes.pop() {
                return Ok(outcome);
            }
        }
        Ok(DetectionOutcome::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    fn detector_with_reply(reply: &str) -> LlmErrorDetector {
        let mock = MockLlmClient::new();
        mock.push_reply(reply);
        LlmErrorDetector::new(Arc::new(mock), 2)
    }

    #[tokio::test]
    async fn test_parses_object_payload() {
        let detector = detector_with_reply(
            r#"{"emotionally_charged": false, "errors": [{"category": "non_finite_verb_form",
                "original_text": "y nadar mucho", "corrected_text": "y nadé mucho",
                "explanation": "el segundo verbo también se conjuga"}]}"#,
        );
        let outcome = detector.detect("yo fui a la playa y nadar mucho", "B1-B2").await.unwrap();
        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].category, ErrorCategory::NonFiniteVerbForm);
        assert!(!outcome.emotionally_charged);
    }

    #[tokio::test]
    async fn test_strips_code_fences() {
        let detector = detector_with_reply(
            "```json\n{\"emotionally_charged\": true, \"errors\": []}\n```",
        );
        let outcome = detector.detect("¡estoy harta!", "B1-B2").await.unwrap();
        assert!(outcome.emotionally_charged);
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_category_rejected() {
        let detector = detector_with_reply(
            r#"{"errors": [{"category": "accent_marks", "original_text": "esta",
                "corrected_text": "está", "explanation": ""}]}"#,
        );
        let outcome = detector.detect("esta bien", "B1-B2").await.unwrap();
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_degrades_to_empty() {
        let detector = detector_with_reply("lo siento, no puedo analizar eso");
        let outcome = detector.detect("hola", "B1-B2").await.unwrap();
        assert!(outcome.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_blank_input_short_circuits() {
        let detector = detector_with_reply("nunca debería llegar aquí");
        let outcome = detector.detect("   ", "B1-B2").await.unwrap();
        assert!(outcome.candidates.is_empty());
    }
}
