//! 领域数据模型
//!
//! 引擎各组件共享的数据结构：对话轮次、纠错标注、词汇卡片、
//! 能力快照、课程单元状态与指令（Directive）。

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// 学习者 ID（跨平台统一，由 Transport 提供）
pub type LearnerId = String;

/// 发言方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// 学习者本人
    Learner,
    /// 辅导引擎（生成的回复）
    Tutor,
    /// 定时触发的系统轮次（晨间消息、周报等），不计入错误/词汇统计
    System,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::Learner => write!(f, "learner"),
            Speaker::Tutor => write!(f, "tutor"),
            Speaker::System => write!(f, "system"),
        }
    }
}

impl Speaker {
    pub fn parse(s: &str) -> Self {
        match s {
            "learner" => Speaker::Learner,
            "tutor" => Speaker::Tutor,
            _ => Speaker::System,
        }
    }
}

/// 单条对话轮次（append-only，写入后不可变）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// 轮次 ID
    pub id: String,
    /// 学习者 ID
    pub learner_id: LearnerId,
    /// 发言方
    pub speaker: Speaker,
    /// 文本内容
    pub text: String,
    /// 写入时间（UTC）
    pub created_at: DateTime<Utc>,
    /// 写入时所处的课程单元
    pub unit_index: u32,
}

impl Turn {
    pub fn new(learner_id: impl Into<LearnerId>, speaker: Speaker, text: impl Into<String>, unit_index: u32) -> Self {
        Self {
            id: format!("turn_{}", uuid::Uuid::new_v4()),
            learner_id: learner_id.into(),
            speaker,
            text: text.into(),
            created_at: Utc::now(),
            unit_index,
        }
    }
}

/// 封闭的错误分类体系
///
/// 检测协作方返回的分类必须落在此枚举内，未知分类被拒绝并记日志，
/// 防止分类漂移。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 动词变位
    VerbConjugation,
    /// ser / estar 混用
    SerEstar,
    /// 性数一致
    GenderAgreement,
    /// 介词
    Preposition,
    /// 虚拟式
    Subjunctive,
    /// 语序
    WordOrder,
    /// 词汇误用
    VocabularyMisuse,
    /// 非限定动词形式（不定式/分词误用）
    NonFiniteVerbForm,
}

impl ErrorCategory {
    /// 全部分类（用于遍历与校验）
    pub fn all() -> &'static [ErrorCategory] {
        &[
            ErrorCategory::VerbConjugation,
            ErrorCategory::SerEstar,
            ErrorCategory::GenderAgreement,
            ErrorCategory::Preposition,
            ErrorCategory::Subjunctive,
            ErrorCategory::WordOrder,
            ErrorCategory::VocabularyMisuse,
            ErrorCategory::NonFiniteVerbForm,
        ]
    }

    /// 从检测协作方的字符串标签解析；未知标签返回 None（而非默认值）
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "verb_conjugation" => Some(Self::VerbConjugation),
            "ser_estar" => Some(Self::SerEstar),
            "gender_agreement" => Some(Self::GenderAgreement),
            "preposition" => Some(Self::Preposition),
            "subjunctive" => Some(Self::Subjunctive),
            "word_order" => Some(Self::WordOrder),
            "vocabulary_misuse" => Some(Self::VocabularyMisuse),
            "non_finite_verb_form" => Some(Self::NonFiniteVerbForm),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerbConjugation => "verb_conjugation",
            Self::SerEstar => "ser_estar",
            Self::GenderAgreement => "gender_agreement",
            Self::Preposition => "preposition",
            Self::Subjunctive => "subjunctive",
            Self::WordOrder => "word_order",
            Self::VocabularyMisuse => "vocabulary_misuse",
            Self::NonFiniteVerbForm => "non_finite_verb_form",
        }
    }

    /// 是否阻碍交流（优先纠正）；其余视为「表面」错误
    pub fn blocks_communication(&self) -> bool {
        matches!(
            self,
            Self::VerbConjugation | Self::WordOrder | Self::VocabularyMisuse | Self::NonFiniteVerbForm
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 检测协作方返回的候选标注（尚未持久化，无序列号）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationCandidate {
    /// 错误分类（已通过封闭体系校验）
    pub category: ErrorCategory,
    /// 原文片段
    pub surface_text: String,
    /// 改正后的形式
    pub corrected_text: String,
    /// 面向学习者的简短说明
    pub explanation: String,
}

/// 已持久化的纠错标注
///
/// (learner, category) 维度的序列号严格递增且无空洞。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnnotation {
    pub turn_id: String,
    pub learner_id: LearnerId,
    pub category: ErrorCategory,
    pub surface_text: String,
    pub corrected_text: String,
    pub explanation: String,
    /// 该 (learner, category) 的第几次出现（从 1 开始）
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

/// 本轮的纠正策略指令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionDirective {
    /// 本轮无需纠正（无错误，或情绪化轮次被抑制）
    None,
    /// 隐式纠正：在回复中自然示范正确用法，不点破
    Implicit(Vec<AnnotationCandidate>),
    /// 显式纠正：同一分类反复出现后，明确指出并解释
    Explicit(Vec<AnnotationCandidate>),
}

impl CorrectionDirective {
    pub fn is_none(&self) -> bool {
        matches!(self, CorrectionDirective::None)
    }

    /// 指令携带的候选标注（None 时为空）
    pub fn candidates(&self) -> &[AnnotationCandidate] {
        match self {
            CorrectionDirective::None => &[],
            CorrectionDirective::Implicit(c) | CorrectionDirective::Explicit(c) => c,
        }
    }
}

/// 词汇卡片（SM-2 间隔重复状态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabularyCard {
    pub learner_id: LearnerId,
    pub word: String,
    pub translation: Option<String>,
    pub example: Option<String>,
    /// 引入时所处单元
    pub introduced_unit: u32,
    pub introduced_at: DateTime<Utc>,
    /// 易度因子，下限 1.3
    pub ease_factor: f64,
    /// 复习间隔（天），下限 1
    pub interval_days: u32,
    /// 连续答对次数
    pub repetition_count: u32,
    pub next_review: NaiveDate,
    pub last_review: Option<NaiveDate>,
    /// 对话中成功使用的累计次数
    pub successful_uses: u32,
    /// 已毕业（长期掌握，不再进入复习队列）
    pub graduated: bool,
}

/// 能力快照：一次评估周期的合成分与各子分
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProficiencySnapshot {
    pub learner_id: LearnerId,
    pub created_at: DateTime<Utc>,
    /// 合成分，恒在 [0,1]
    pub composite: f64,
    pub components: ComponentScores,
}

/// 各子分（均已归一化到 [0,1]）
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ComponentScores {
    /// 错误率趋势（下降得高分）
    pub error_trend: f64,
    /// 词汇多样性（unique / total）
    pub vocab_diversity: f64,
    /// 语法复杂度信号（从句/虚拟式标记率）
    pub grammar_complexity: f64,
    /// 会话深度（平均轮长 + 追问率）
    pub depth: f64,
    /// 参与度（活跃天数占比）
    pub engagement: f64,
}

/// 课程单元状态；每个学习者任意时刻恰有一条 active 记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitState {
    pub learner_id: LearnerId,
    pub unit_index: u32,
    pub entered_at: DateTime<Utc>,
    /// 单元内掌握度估计（来自单元窗口内的快照均值）
    pub mastery: f64,
    /// 历次决策（JSON 序列化存储）
    pub decisions: Vec<UnitDecisionRecord>,
    pub active: bool,
}

/// 一次状态机决策及其时间
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitDecisionRecord {
    pub decision: UnitDecision,
    pub mastery: f64,
    pub at: DateTime<Utc>,
}

/// 状态机决策结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitDecision {
    /// 晋级下一单元
    Advance,
    /// 掌握不足，留在本单元并加强练习
    Extend,
    /// 提前达标，向学习者发出跳级邀约（不自动晋级）
    OfferSkip,
    /// 正常继续
    Continue,
    /// 课程全部完成（终态，仅发出一次）
    Completed,
}

/// 学习者档案
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerProfile {
    pub id: LearnerId,
    pub display_name: String,
    pub current_unit: u32,
    pub unit_entered_at: DateTime<Utc>,
    /// IANA 时区名，用于定时触发（默认 Europe/Madrid）
    pub timezone: String,
    /// 可变偏好集合
    pub preferences: std::collections::HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// 系统发起轮次的种类（外部定时器触发）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemTurnKind {
    /// 晨间问候
    Morning,
    /// 不活跃提醒
    InactivityNudge,
    /// 每周学习小结
    WeeklyReport,
}

impl SystemTurnKind {
    /// 注入生成请求的提示语
    pub fn prompt(&self) -> &'static str {
        match self {
            Self::Morning => "Inicia la conversación de la mañana con un saludo breve y una pregunta sencilla del tema de la semana.",
            Self::InactivityNudge => "El estudiante lleva días sin practicar. Envía un mensaje corto y amable para retomar la conversación.",
            Self::WeeklyReport => "Resume en tono alentador el progreso de la semana: vocabulario nuevo, errores que mejoraron y el tema actual.",
        }
    }
}
