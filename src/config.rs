//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PROFE__*` 覆盖（双下划线表示嵌套，
//! 如 `PROFE__LLM__MODEL=gpt-4o-mini`）。阈值类参数（晋级/加强门槛、SM-2 常量等）
//! 全部可配置，内置默认值开箱可用。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub correction: CorrectionSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub proficiency: ProficiencySection,
    #[serde(default)]
    pub curriculum: CurriculumSection,
}

/// [app] 段：数据目录、上下文与留存窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// SQLite 数据库路径，未设置时用 data/profe.sqlite
    pub db_path: Option<PathBuf>,
    /// 上下文保留的最近轮数
    pub max_context_turns: usize,
    /// 上下文 token 预算（与轮数限制取先到者）
    pub context_token_budget: usize,
    /// 轮次留存窗口（天），超龄轮次被剪枝、不进入上下文
    pub retention_days: i64,
    /// 默认时区（首次建档用）
    pub default_timezone: String,
    /// 目标语言等级标签，传给检测协作方
    pub level_tag: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            db_path: None,
            max_context_turns: 20,
            context_token_budget: 2000,
            retention_days: 30,
            default_timezone: "Europe/Madrid".to_string(),
            level_tag: "B1-B2".to_string(),
        }
    }
}

/// [llm] 段：生成协作方的端点与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub base_url: Option<String>,
    /// 单次生成请求超时（秒）
    pub request_timeout_secs: u64,
    /// 失败重试上限（指数退避）
    pub max_retries: u32,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 30,
            max_retries: 3,
            max_tokens: 500,
            temperature: 0.8,
        }
    }
}

/// [correction] 段：纠错策略阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrectionSection {
    /// 单轮最多纠正条数
    pub max_per_turn: usize,
    /// 同一分类在留存窗口内出现达到此次数后升级为显式纠正
    pub explicit_after: u64,
    /// 显式纠正后连续正确使用达到此次数则降回隐式
    pub demote_after_correct: u32,
}

impl Default for CorrectionSection {
    fn default() -> Self {
        Self {
            max_per_turn: 2,
            explicit_after: 3,
            demote_after_correct: 2,
        }
    }
}

/// [review] 段：间隔重复参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    /// 上下文中出现的待复习卡片上限
    pub due_cards_cap: usize,
    /// 毕业判定：间隔达到此天数
    pub graduation_interval_days: u32,
    /// 毕业判定：连续答对达到此次数
    pub graduation_repetitions: u32,
    /// 复习会话不活跃超时（分钟）
    pub session_timeout_minutes: i64,
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            due_cards_cap: 5,
            graduation_interval_days: 60,
            graduation_repetitions: 5,
            session_timeout_minutes: 10,
        }
    }
}

/// [proficiency] 段：合成分权重与窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProficiencySection {
    /// 滑动窗口（天）
    pub window_days: i64,
    pub weight_error_trend: f64,
    pub weight_vocab_diversity: f64,
    pub weight_grammar_complexity: f64,
    pub weight_depth: f64,
    pub weight_engagement: f64,
}

impl Default for ProficiencySection {
    fn default() -> Self {
        Self {
            window_days: 14,
            weight_error_trend: 0.30,
            weight_vocab_diversity: 0.25,
            weight_grammar_complexity: 0.20,
            weight_depth: 0.15,
            weight_engagement: 0.10,
        }
    }
}

/// [curriculum] 段：状态机阈值与课程表路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CurriculumSection {
    /// 课程表 TOML 路径，缺失时用内置默认课程
    pub catalog_path: Option<PathBuf>,
    /// 晋级掌握度门槛
    pub advance_threshold: f64,
    /// 加强练习掌握度门槛（低于此值且超时则 Extend）
    pub extend_threshold: f64,
    /// 提前跳级门槛
    pub skip_threshold: f64,
    /// 晋级前最少停留天数
    pub min_dwell_days: i64,
    /// 超过此天数仍未达标则 Extend
    pub max_dwell_days: i64,
    /// 跳级邀约只在进入单元的前几天发出
    pub skip_window_days: i64,
    /// Extend 时给出的最弱分类数
    pub weakest_categories: usize,
}

impl Default for CurriculumSection {
    fn default() -> Self {
        Self {
            catalog_path: None,
            advance_threshold: 0.75,
            extend_threshold: 0.50,
            skip_threshold: 0.90,
            min_dwell_days: 7,
            max_dwell_days: 10,
            skip_window_days: 3,
            weakest_categories: 3,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            correction: CorrectionSection::default(),
            review: ReviewSection::default(),
            proficiency: ProficiencySection::default(),
            curriculum: CurriculumSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 PROFE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 PROFE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PROFE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_context_turns, 20);
        assert_eq!(cfg.app.retention_days, 30);
        assert_eq!(cfg.correction.explicit_after, 3);
        assert_eq!(cfg.curriculum.advance_threshold, 0.75);
        assert_eq!(cfg.curriculum.extend_threshold, 0.50);
        assert_eq!(cfg.curriculum.min_dwell_days, 7);
        assert_eq!(cfg.curriculum.max_dwell_days, 10);
        let weight_sum = cfg.proficiency.weight_error_trend
            + cfg.proficiency.weight_vocab_diversity
            + cfg.proficiency.weight_grammar_complexity
            + cfg.proficiency.weight_depth
            + cfg.proficiency.weight_engagement;
        assert!((weight_sum - 1.0).abs() < 1e-9);
    }
}
