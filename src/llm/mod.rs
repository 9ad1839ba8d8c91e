//! LLM 层：生成客户端抽象与错误检测协作方（OpenAI 兼容 / Mock）

pub mod detector;
pub mod mock;
pub mod openai;
pub mod traits;

pub use detector::{DetectionOutcome, ErrorDetector, LlmErrorDetector, ScriptedDetector};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{ChatMessage, ChatRole, LlmClient, LlmError};
