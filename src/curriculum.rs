//! 课程：单元目录与晋级状态机
//!
//! 目录是有序有限的单元序列（默认 16 个，对应多周进度），每单元带语法主题
//! 与主题词汇，供 ContextAssembler 组装教学目标。状态机每评估周期运行一次：
//! 掌握度与停留天数共同决定 Advance / Extend / OfferSkip / Continue，
//! 末单元达标时发出一次 Completed 后不再产生晋级/保留指令。

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::config::CurriculumSection;
use crate::model::{ProficiencySnapshot, UnitDecision, UnitState};

/// 目录中的词汇条目
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogWord {
    pub word: String,
    pub translation: String,
    #[serde(default)]
    pub example: String,
}

/// 单个课程单元的内容
#[derive(Debug, Clone, Deserialize)]
pub struct UnitLesson {
    pub index: u32,
    pub title: String,
    #[serde(default)]
    pub grammar_topics: Vec<String>,
    #[serde(default)]
    pub vocabulary_theme: String,
    #[serde(default)]
    pub vocabulary_words: Vec<CatalogWord>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[serde(default = "default_total_units")]
    total_units: u32,
    #[serde(default)]
    units: Vec<UnitLesson>,
}

fn default_total_units() -> u32 {
    16
}

/// 内置默认课程（目录文件缺失时的兜底）
const DEFAULT_CATALOG: &str = r#"
total_units = 16

[[units]]
index = 0
title = "Presentaciones y vida cotidiana"
grammar_topics = ["presente de indicativo", "ser vs estar"]
vocabulary_theme = "rutinas diarias"
vocabulary_words = [
    { word = "madrugar", translation = "to get up early", example = "Mañana tengo que madrugar." },
    { word = "soler", translation = "to usually do", example = "Suelo desayunar a las ocho." },
]

[[units]]
index = 1
title = "Narrar el pasado"
grammar_topics = ["pretérito indefinido", "pretérito imperfecto"]
vocabulary_theme = "viajes y recuerdos"
vocabulary_words = [
    { word = "atardecer", translation = "dusk", example = "Llegamos al atardecer." },
    { word = "alojarse", translation = "to stay (lodging)", example = "Nos alojamos en un hostal." },
]

[[units]]
index = 2
title = "Planes y futuro"
grammar_topics = ["futuro simple", "ir a + infinitivo"]
vocabulary_theme = "trabajo y proyectos"
vocabulary_words = [
    { word = "plazo", translation = "deadline", example = "El plazo termina el viernes." },
    { word = "emprender", translation = "to undertake", example = "Quiere emprender un negocio." },
]

[[units]]
index = 3
title = "Opiniones y subjuntivo"
grammar_topics = ["presente de subjuntivo", "expresar opinión y duda"]
vocabulary_theme = "sociedad y medios"
vocabulary_words = [
    { word = "titular", translation = "headline", example = "No creo que el titular sea cierto." },
    { word = "asunto", translation = "matter, issue", example = "Es un asunto complicado." },
]
"#;

/// 课程单元目录
pub struct CurriculumCatalog {
    total_units: u32,
    units: Vec<UnitLesson>,
}

impl CurriculumCatalog {
    /// 从 TOML 文件加载；文件缺失或损坏时退回内置默认课程（记日志，不报错）
    pub fn load(path: Option<&Path>) -> Self {
        if let Some(path) = path {
            match std::fs::read_to_string(path) {
                Ok(raw) => match toml::from_str::<CatalogFile>(&raw) {
                    Ok(file) => {
                        tracing::info!(path = %path.display(), units = file.units.len(), "Curriculum loaded");
                        return Self { total_units: file.total_units, units: file.units };
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "Failed to parse curriculum, using built-in");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Curriculum file not found, using built-in");
                }
            }
        }
        let file: CatalogFile = toml::from_str(DEFAULT_CATALOG).expect("built-in curriculum is valid");
        Self { total_units: file.total_units, units: file.units }
    }

    pub fn total_units(&self) -> u32 {
        self.total_units
    }

    /// 指定单元的内容；目录中没有时返回 None
    pub fn unit(&self, index: u32) -> Option<&UnitLesson> {
        self.units.iter().find(|u| u.index == index)
    }

    /// 组装该单元的教学目标文本（目录缺内容时给出通用目标）
    pub fn lesson_goals(&self, index: u32) -> String {
        match self.unit(index) {
            Some(lesson) => {
                let mut goals = format!(
                    "Unidad {} de {}: {}. Temas de gramática: {}.",
                    index + 1,
                    self.total_units,
                    lesson.title,
                    lesson.grammar_topics.join(", "),
                );
                if !lesson.vocabulary_theme.is_empty() {
                    goals.push_str(&format!(" Vocabulario: {}.", lesson.vocabulary_theme));
                }
                goals
            }
            None => format!(
                "Unidad {} de {}: conversación libre consolidando lo aprendido.",
                index + 1,
                self.total_units,
            ),
        }
    }
}

/// 由单元窗口内的快照得到掌握度估计（均值；无快照时为 0，无证据不晋级）
pub fn mastery_estimate(snapshots: &[ProficiencySnapshot]) -> f64 {
    if snapshots.is_empty() {
        return 0.0;
    }
    snapshots.iter().map(|s| s.composite).sum::<f64>() / snapshots.len() as f64
}

/// 晋级状态机
pub struct CurriculumStateMachine {
    catalog: CurriculumCatalog,
    cfg: CurriculumSection,
}

impl CurriculumStateMachine {
    pub fn new(catalog: CurriculumCatalog, cfg: CurriculumSection) -> Self {
        Self { catalog, cfg }
    }

    pub fn catalog(&self) -> &CurriculumCatalog {
        &self.catalog
    }

    /// 每评估周期运行一次的纯决策函数
    pub fn evaluate(&self, state: &UnitState, mastery: f64, now: DateTime<Utc>) -> UnitDecision {
        let final_unit = state.unit_index + 1 >= self.catalog.total_units;
        let already_completed = state
            .decisions
            .iter()
            .any(|d| d.decision == UnitDecision::Completed);
        // 终态：完成事件只发一次，此后不再产生晋级/保留指令
        if final_unit && already_completed {
            return UnitDecision::Continue;
        }

        let days_in_unit = (now - state.entered_at).num_days();

        if mastery >= self.cfg.advance_threshold && days_in_unit >= self.cfg.min_dwell_days {
            return if final_unit { UnitDecision::Completed } else { UnitDecision::Advance };
        }
        if mastery < self.cfg.extend_threshold && days_in_unit >= self.cfg.max_dwell_days {
            return UnitDecision::Extend;
        }
        if mastery >= self.cfg.skip_threshold && days_in_unit <= self.cfg.skip_window_days {
            // 同一决策不重复发出邀约
            let last_was_offer = state
                .decisions
                .last()
                .map(|d| d.decision == UnitDecision::OfferSkip)
                .unwrap_or(false);
            if !last_was_offer {
                return UnitDecision::OfferSkip;
            }
        }
        UnitDecision::Continue
    }

    /// 跳级邀约被学习者明确接受后才允许的晋级目标
    pub fn skip_target(&self, state: &UnitState) -> Option<u32> {
        let offered = state
            .decisions
            .iter()
            .any(|d| d.decision == UnitDecision::OfferSkip);
        if offered && state.unit_index + 1 < self.catalog.total_units {
            Some(state.unit_index + 1)
        } else {
            None
        }
    }
}
