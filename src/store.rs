//! SQLite 持久化存储
//!
//! 核心表：learner_profiles / turns / error_annotations（含 correction_state）/
//! vocabulary_cards / proficiency_snapshots / unit_states。
//! 对外唯一承诺：持久性，以及「每轮效果整体原子提交」——
//! `apply_turn_effects` 在单个事务内落盘本轮全部状态变更，失败则整体回滚、可重放。
//!
//! 同步 rusqlite 连接置于 tokio Mutex 之后；所有读写都是快速操作，不跨网络调用持锁。

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use crate::correction::CategoryState;
use crate::error::EngineError;
use crate::model::{
    ComponentScores, ErrorAnnotation, ErrorCategory, LearnerId, LearnerProfile,
    ProficiencySnapshot, Speaker, Turn, UnitDecisionRecord, UnitState, VocabularyCard,
};

/// 词汇掌握统计（mastered: repetition ≥ 3 且 interval ≥ 14）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MasteryStats {
    pub total: u32,
    pub mastered: u32,
    pub learning: u32,
    pub fresh: u32,
}

/// 单元切换（旧记录置为 inactive，新记录插入为 active）
#[derive(Debug, Clone)]
pub struct UnitTransition {
    pub to_unit: u32,
    pub at: DateTime<Utc>,
}

/// 一轮对话的全部持久化效果，作为单个逻辑单元提交
///
/// 学习者入站轮次不在此列——无论生成成败它都已单独落盘，保证上下文连续。
#[derive(Debug, Default)]
pub struct TurnEffects {
    pub learner_id: LearnerId,
    /// 导师回复轮次（生成失败的轮次没有）
    pub tutor_turn: Option<Turn>,
    /// 本轮持久化的标注（序列号已由 ErrorTracker 分配）
    pub annotations: Vec<ErrorAnnotation>,
    /// 各分类的升降级状态整行替换
    pub category_states: Vec<(ErrorCategory, CategoryState)>,
    /// 卡片更新与新引入卡片（整行 upsert）
    pub card_upserts: Vec<VocabularyCard>,
    /// 本轮的能力快照
    pub snapshot: Option<ProficiencySnapshot>,
    /// 追加到当前单元决策史的记录
    pub decision: Option<UnitDecisionRecord>,
    /// 当前单元掌握度估计更新
    pub mastery: Option<f64>,
    /// 晋级切换
    pub transition: Option<UnitTransition>,
}

impl TurnEffects {
    pub fn new(learner_id: impl Into<LearnerId>) -> Self {
        Self {
            learner_id: learner_id.into(),
            ..Default::default()
        }
    }
}

/// 存储层：持有唯一 SQLite 连接
pub struct TutorStore {
    conn: Mutex<Connection>,
}

impl TutorStore {
    /// 打开（或创建）数据库文件并初始化 schema
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Persistence(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn init_schema(conn: &Connection) -> Result<(), EngineError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS learner_profiles (
                id              TEXT PRIMARY KEY,
                display_name    TEXT NOT NULL,
                current_unit    INTEGER NOT NULL DEFAULT 0,
                unit_entered_at TEXT NOT NULL,
                timezone        TEXT NOT NULL,
                preferences     TEXT NOT NULL DEFAULT '{}',
                created_at      TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS turns (
                id         TEXT PRIMARY KEY,
                learner_id TEXT NOT NULL,
                speaker    TEXT NOT NULL,
                text       TEXT NOT NULL,
                created_at TEXT NOT NULL,
                unit_index INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_turns_learner ON turns (learner_id, created_at);

            CREATE TABLE IF NOT EXISTS error_annotations (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                turn_id        TEXT NOT NULL,
                learner_id     TEXT NOT NULL,
                category       TEXT NOT NULL,
                surface_text   TEXT NOT NULL,
                corrected_text TEXT NOT NULL,
                explanation    TEXT NOT NULL,
                seq            INTEGER NOT NULL,
                created_at     TEXT NOT NULL,
                UNIQUE (learner_id, category, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_annotations_learner
                ON error_annotations (learner_id, created_at);

            CREATE TABLE IF NOT EXISTS correction_state (
                learner_id          TEXT NOT NULL,
                category            TEXT NOT NULL,
                last_seq            INTEGER NOT NULL DEFAULT 0,
                escalated           INTEGER NOT NULL DEFAULT 0,
                consecutive_correct INTEGER NOT NULL DEFAULT 0,
                demoted_base        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (learner_id, category)
            );

            CREATE TABLE IF NOT EXISTS vocabulary_cards (
                learner_id       TEXT NOT NULL,
                word             TEXT NOT NULL,
                translation      TEXT,
                example          TEXT,
                introduced_unit  INTEGER NOT NULL,
                introduced_at    TEXT NOT NULL,
                ease_factor      REAL NOT NULL,
                interval_days    INTEGER NOT NULL,
                repetition_count INTEGER NOT NULL,
                next_review      TEXT NOT NULL,
                last_review      TEXT,
                successful_uses  INTEGER NOT NULL DEFAULT 0,
                graduated        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (learner_id, word)
            );
            CREATE INDEX IF NOT EXISTS idx_cards_due
                ON vocabulary_cards (learner_id, graduated, next_review);

            CREATE TABLE IF NOT EXISTS proficiency_snapshots (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                composite  REAL NOT NULL,
                components TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_learner
                ON proficiency_snapshots (learner_id, created_at);

            CREATE TABLE IF NOT EXISTS unit_states (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL,
                unit_index INTEGER NOT NULL,
                entered_at TEXT NOT NULL,
                mastery    REAL NOT NULL DEFAULT 0,
                decisions  TEXT NOT NULL DEFAULT '[]',
                active     INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_unit_states_learner
                ON unit_states (learner_id, active);
            "#,
        )?;
        Ok(())
    }

    // ---------- 档案 ----------

    /// 首次接触时建档并创建初始 active UnitState；已存在则直接返回
    pub async fn get_or_create_profile(
        &self,
        learner_id: &str,
        display_name: &str,
        timezone: &str,
        starting_unit: u32,
    ) -> Result<LearnerProfile, EngineError> {
        let conn = self.conn.lock().await;
        if let Some(profile) = Self::query_profile(&conn, learner_id)? {
            return Ok(profile);
        }

        let now = Utc::now();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO learner_profiles (id, display_name, current_unit, unit_entered_at, timezone, preferences, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6)",
            params![learner_id, display_name, starting_unit, now, timezone, now],
        )?;
        tx.execute(
            "INSERT INTO unit_states (learner_id, unit_index, entered_at, mastery, decisions, active)
             VALUES (?1, ?2, ?3, 0, '[]', 1)",
            params![learner_id, starting_unit, now],
        )?;
        tx.commit()?;
        tracing::info!(learner_id, starting_unit, "Created learner profile");

        Ok(LearnerProfile {
            id: learner_id.to_string(),
            display_name: display_name.to_string(),
            current_unit: starting_unit,
            unit_entered_at: now,
            timezone: timezone.to_string(),
            preferences: HashMap::new(),
            created_at: now,
        })
    }

    pub async fn get_profile(&self, learner_id: &str) -> Result<Option<LearnerProfile>, EngineError> {
        let conn = self.conn.lock().await;
        Self::query_profile(&conn, learner_id)
    }

    fn query_profile(conn: &Connection, learner_id: &str) -> Result<Option<LearnerProfile>, EngineError> {
        let profile = conn
            .query_row(
                "SELECT id, display_name, current_unit, unit_entered_at, timezone, preferences, created_at
                 FROM learner_profiles WHERE id = ?1",
                params![learner_id],
                |row| {
                    let prefs_json: String = row.get(5)?;
                    Ok(LearnerProfile {
                        id: row.get(0)?,
                        display_name: row.get(1)?,
                        current_unit: row.get(2)?,
                        unit_entered_at: row.get(3)?,
                        timezone: row.get(4)?,
                        preferences: serde_json::from_str(&prefs_json).unwrap_or_default(),
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }

    /// 更新单个偏好键
    pub async fn set_preference(&self, learner_id: &str, key: &str, value: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        let prefs_json: Option<String> = conn
            .query_row(
                "SELECT preferences FROM learner_profiles WHERE id = ?1",
                params![learner_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(prefs_json) = prefs_json else {
            return Err(EngineError::UnknownLearner(learner_id.to_string()));
        };
        let mut prefs: HashMap<String, String> =
            serde_json::from_str(&prefs_json).unwrap_or_default();
        prefs.insert(key.to_string(), value.to_string());
        conn.execute(
            "UPDATE learner_profiles SET preferences = ?2 WHERE id = ?1",
            params![learner_id, serde_json::to_string(&prefs).unwrap_or_else(|_| "{}".into())],
        )?;
        Ok(())
    }

    /// 显式抹除请求：删除该学习者的全部数据
    pub async fn erase_learner(&self, learner_id: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;
        for table in [
            "learner_profiles",
            "turns",
            "error_annotations",
            "correction_state",
            "vocabulary_cards",
            "proficiency_snapshots",
            "unit_states",
        ] {
            let col = if table == "learner_profiles" { "id" } else { "learner_id" };
            tx.execute(
                &format!("DELETE FROM {table} WHERE {col} = ?1"),
                params![learner_id],
            )?;
        }
        tx.commit()?;
        tracing::info!(learner_id, "Erased learner data");
        Ok(())
    }

    // ---------- 轮次 ----------

    /// 追加单条轮次（入站轮次独立于本轮事务落盘）
    pub async fn append_turn(&self, turn: &Turn) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        Self::insert_turn(&conn, turn)
    }

    fn insert_turn(conn: &Connection, turn: &Turn) -> Result<(), EngineError> {
        conn.execute(
            "INSERT INTO turns (id, learner_id, speaker, text, created_at, unit_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.id,
                turn.learner_id,
                turn.speaker.to_string(),
                turn.text,
                turn.created_at,
                turn.unit_index
            ],
        )?;
        Ok(())
    }

    /// 最近 limit 条、且不早于 since 的轮次，按时间正序返回
    pub async fn recent_turns(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Turn>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, learner_id, speaker, text, created_at, unit_index
             FROM turns
             WHERE learner_id = ?1 AND created_at >= ?2
             ORDER BY created_at DESC, id DESC
             LIMIT ?3",
        )?;
        let mut turns: Vec<Turn> = stmt
            .query_map(params![learner_id, since, limit as i64], Self::row_to_turn)?
            .collect::<Result<_, _>>()?;
        // 逆序取出，反转为正序供上下文使用
        turns.reverse();
        Ok(turns)
    }

    /// 窗口内全部轮次（能力评估用），按时间正序
    pub async fn turns_since(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Turn>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, learner_id, speaker, text, created_at, unit_index
             FROM turns
             WHERE learner_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let turns = stmt
            .query_map(params![learner_id, since], Self::row_to_turn)?
            .collect::<Result<_, _>>()?;
        Ok(turns)
    }

    fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<Turn> {
        let speaker: String = row.get(2)?;
        Ok(Turn {
            id: row.get(0)?,
            learner_id: row.get(1)?,
            speaker: Speaker::parse(&speaker),
            text: row.get(3)?,
            created_at: row.get(4)?,
            unit_index: row.get(5)?,
        })
    }

    /// 剪枝：删除早于 cutoff 的轮次，返回删除条数
    pub async fn prune_turns(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError> {
        let conn = self.conn.lock().await;
        let n = conn.execute("DELETE FROM turns WHERE created_at < ?1", params![cutoff])?;
        if n > 0 {
            tracing::info!(pruned = n, "Pruned turns past retention window");
        }
        Ok(n)
    }

    pub async fn count_turns(&self, learner_id: &str) -> Result<u64, EngineError> {
        let conn = self.conn.lock().await;
        let n: i64 = conn.query_row(
            "SELECT COUNT(1) FROM turns WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    // ---------- 标注与纠错状态 ----------

    /// 窗口内的全部标注，按时间正序
    pub async fn annotations_since(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ErrorAnnotation>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT turn_id, learner_id, category, surface_text, corrected_text, explanation, seq, created_at
             FROM error_annotations
             WHERE learner_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, seq ASC",
        )?;
        let rows = stmt.query_map(params![learner_id, since], |row| {
            let cat: String = row.get(2)?;
            Ok((cat, ErrorAnnotationRaw {
                turn_id: row.get(0)?,
                learner_id: row.get(1)?,
                surface_text: row.get(3)?,
                corrected_text: row.get(4)?,
                explanation: row.get(5)?,
                seq: row.get::<_, i64>(6)? as u64,
                created_at: row.get(7)?,
            }))
        })?;

        let mut annotations = Vec::new();
        for row in rows {
            let (cat, raw) = row?;
            // 分类来自封闭体系，历史行不可解析时跳过（防御旧数据）
            if let Some(category) = ErrorCategory::parse(&cat) {
                annotations.push(ErrorAnnotation {
                    turn_id: raw.turn_id,
                    learner_id: raw.learner_id,
                    category,
                    surface_text: raw.surface_text,
                    corrected_text: raw.corrected_text,
                    explanation: raw.explanation,
                    seq: raw.seq,
                    created_at: raw.created_at,
                });
            }
        }
        Ok(annotations)
    }

    /// 窗口内各分类出现次数
    pub async fn occurrence_counts(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<HashMap<ErrorCategory, u64>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(1) FROM error_annotations
             WHERE learner_id = ?1 AND created_at >= ?2
             GROUP BY category",
        )?;
        let rows = stmt.query_map(params![learner_id, since], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (cat, n) = row?;
            if let Some(category) = ErrorCategory::parse(&cat) {
                counts.insert(category, n);
            }
        }
        Ok(counts)
    }

    /// 各分类的升降级状态
    pub async fn category_states(
        &self,
        learner_id: &str,
    ) -> Result<HashMap<ErrorCategory, CategoryState>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT category, last_seq, escalated, consecutive_correct, demoted_base
             FROM correction_state WHERE learner_id = ?1",
        )?;
        let rows = stmt.query_map(params![learner_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                CategoryState {
                    last_seq: row.get::<_, i64>(1)? as u64,
                    escalated: row.get::<_, i64>(2)? != 0,
                    consecutive_correct: row.get::<_, i64>(3)? as u32,
                    demoted_base: row.get::<_, i64>(4)? as u64,
                },
            ))
        })?;
        let mut states = HashMap::new();
        for row in rows {
            let (cat, state) = row?;
            if let Some(category) = ErrorCategory::parse(&cat) {
                states.insert(category, state);
            }
        }
        Ok(states)
    }

    // ---------- 词汇卡片 ----------

    pub async fn get_card(
        &self,
        learner_id: &str,
        word: &str,
    ) -> Result<Option<VocabularyCard>, EngineError> {
        let conn = self.conn.lock().await;
        let card = conn
            .query_row(
                &format!("{CARD_COLUMNS} WHERE learner_id = ?1 AND word = ?2"),
                params![learner_id, word],
                Self::row_to_card,
            )
            .optional()?;
        Ok(card)
    }

    /// 待复习卡片：next_review ≤ as_of 且未毕业；
    /// 按 next_review 正序、易度因子正序（最弱的先出）
    pub async fn due_cards(
        &self,
        learner_id: &str,
        as_of: NaiveDate,
        cap: usize,
    ) -> Result<Vec<VocabularyCard>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{CARD_COLUMNS}
             WHERE learner_id = ?1 AND graduated = 0 AND next_review <= ?2
             ORDER BY next_review ASC, ease_factor ASC
             LIMIT ?3"
        ))?;
        let cards = stmt
            .query_map(params![learner_id, as_of, cap as i64], Self::row_to_card)?
            .collect::<Result<_, _>>()?;
        Ok(cards)
    }

    pub async fn all_cards(&self, learner_id: &str) -> Result<Vec<VocabularyCard>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{CARD_COLUMNS} WHERE learner_id = ?1 ORDER BY introduced_at ASC"
        ))?;
        let cards = stmt
            .query_map(params![learner_id], Self::row_to_card)?
            .collect::<Result<_, _>>()?;
        Ok(cards)
    }

    /// 引入新卡片；(learner, word) 已存在时不做任何事，返回 false
    pub async fn introduce_card(&self, card: &VocabularyCard) -> Result<bool, EngineError> {
        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM vocabulary_cards WHERE learner_id = ?1 AND word = ?2",
                params![card.learner_id, card.word],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(false);
        }
        Self::upsert_card(&conn, card)?;
        Ok(true)
    }

    fn upsert_card(conn: &Connection, card: &VocabularyCard) -> Result<(), EngineError> {
        conn.execute(
            "INSERT OR REPLACE INTO vocabulary_cards
             (learner_id, word, translation, example, introduced_unit, introduced_at,
              ease_factor, interval_days, repetition_count, next_review, last_review,
              successful_uses, graduated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                card.learner_id,
                card.word,
                card.translation,
                card.example,
                card.introduced_unit,
                card.introduced_at,
                card.ease_factor,
                card.interval_days,
                card.repetition_count,
                card.next_review,
                card.last_review,
                card.successful_uses,
                card.graduated as i64,
            ],
        )?;
        Ok(())
    }

    fn row_to_card(row: &Row<'_>) -> rusqlite::Result<VocabularyCard> {
        Ok(VocabularyCard {
            learner_id: row.get(0)?,
            word: row.get(1)?,
            translation: row.get(2)?,
            example: row.get(3)?,
            introduced_unit: row.get(4)?,
            introduced_at: row.get(5)?,
            ease_factor: row.get(6)?,
            interval_days: row.get(7)?,
            repetition_count: row.get(8)?,
            next_review: row.get(9)?,
            last_review: row.get(10)?,
            successful_uses: row.get(11)?,
            graduated: row.get::<_, i64>(12)? != 0,
        })
    }

    /// 词汇掌握统计
    pub async fn mastery_stats(&self, learner_id: &str) -> Result<MasteryStats, EngineError> {
        let conn = self.conn.lock().await;
        let total: i64 = conn.query_row(
            "SELECT COUNT(1) FROM vocabulary_cards WHERE learner_id = ?1",
            params![learner_id],
            |row| row.get(0),
        )?;
        let mastered: i64 = conn.query_row(
            "SELECT COUNT(1) FROM vocabulary_cards
             WHERE learner_id = ?1 AND repetition_count >= 3 AND interval_days >= 14",
            params![learner_id],
            |row| row.get(0),
        )?;
        let learning: i64 = conn.query_row(
            "SELECT COUNT(1) FROM vocabulary_cards
             WHERE learner_id = ?1 AND repetition_count >= 1
               AND NOT (repetition_count >= 3 AND interval_days >= 14)",
            params![learner_id],
            |row| row.get(0),
        )?;
        Ok(MasteryStats {
            total: total as u32,
            mastered: mastered as u32,
            learning: learning as u32,
            fresh: (total - mastered - learning).max(0) as u32,
        })
    }

    // ---------- 能力快照 ----------

    pub async fn latest_snapshot(
        &self,
        learner_id: &str,
    ) -> Result<Option<ProficiencySnapshot>, EngineError> {
        let conn = self.conn.lock().await;
        let snapshot = conn
            .query_row(
                "SELECT learner_id, created_at, composite, components
                 FROM proficiency_snapshots
                 WHERE learner_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                params![learner_id],
                Self::row_to_snapshot,
            )
            .optional()?;
        Ok(snapshot)
    }

    pub async fn snapshots_since(
        &self,
        learner_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ProficiencySnapshot>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT learner_id, created_at, composite, components
             FROM proficiency_snapshots
             WHERE learner_id = ?1 AND created_at >= ?2
             ORDER BY created_at ASC, id ASC",
        )?;
        let snapshots = stmt
            .query_map(params![learner_id, since], Self::row_to_snapshot)?
            .collect::<Result<_, _>>()?;
        Ok(snapshots)
    }

    fn row_to_snapshot(row: &Row<'_>) -> rusqlite::Result<ProficiencySnapshot> {
        let components_json: String = row.get(3)?;
        Ok(ProficiencySnapshot {
            learner_id: row.get(0)?,
            created_at: row.get(1)?,
            composite: row.get(2)?,
            components: serde_json::from_str::<ComponentScores>(&components_json)
                .unwrap_or_default(),
        })
    }

    // ---------- 单元状态 ----------

    /// 当前 active 的单元状态（每学习者恰有一条）
    pub async fn active_unit_state(
        &self,
        learner_id: &str,
    ) -> Result<Option<UnitState>, EngineError> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                "SELECT learner_id, unit_index, entered_at, mastery, decisions, active
                 FROM unit_states
                 WHERE learner_id = ?1 AND active = 1",
                params![learner_id],
                Self::row_to_unit_state,
            )
            .optional()?;
        Ok(state)
    }

    pub async fn unit_state_history(
        &self,
        learner_id: &str,
    ) -> Result<Vec<UnitState>, EngineError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT learner_id, unit_index, entered_at, mastery, decisions, active
             FROM unit_states WHERE learner_id = ?1 ORDER BY entered_at ASC, id ASC",
        )?;
        let states = stmt
            .query_map(params![learner_id], Self::row_to_unit_state)?
            .collect::<Result<_, _>>()?;
        Ok(states)
    }

    fn row_to_unit_state(row: &Row<'_>) -> rusqlite::Result<UnitState> {
        let decisions_json: String = row.get(4)?;
        Ok(UnitState {
            learner_id: row.get(0)?,
            unit_index: row.get(1)?,
            entered_at: row.get(2)?,
            mastery: row.get(3)?,
            decisions: serde_json::from_str(&decisions_json).unwrap_or_default(),
            active: row.get::<_, i64>(5)? != 0,
        })
    }

    // ---------- 每轮原子提交 ----------

    /// 在单个事务内提交本轮全部效果；任何一步失败则整体回滚
    pub async fn apply_turn_effects(&self, effects: &TurnEffects) -> Result<(), EngineError> {
        let conn = self.conn.lock().await;
        let tx = conn.unchecked_transaction()?;

        if let Some(ref turn) = effects.tutor_turn {
            Self::insert_turn(&tx, turn)?;
        }

        for annotation in &effects.annotations {
            tx.execute(
                "INSERT INTO error_annotations
                 (turn_id, learner_id, category, surface_text, corrected_text, explanation, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    annotation.turn_id,
                    annotation.learner_id,
                    annotation.category.as_str(),
                    annotation.surface_text,
                    annotation.corrected_text,
                    annotation.explanation,
                    annotation.seq as i64,
                    annotation.created_at,
                ],
            )?;
        }

        for (category, state) in &effects.category_states {
            tx.execute(
                "INSERT OR REPLACE INTO correction_state
                 (learner_id, category, last_seq, escalated, consecutive_correct, demoted_base)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    effects.learner_id,
                    category.as_str(),
                    state.last_seq as i64,
                    state.escalated as i64,
                    state.consecutive_correct as i64,
                    state.demoted_base as i64,
                ],
            )?;
        }

        for card in &effects.card_upserts {
            Self::upsert_card(&tx, card)?;
        }

        if let Some(ref snapshot) = effects.snapshot {
            tx.execute(
                "INSERT INTO proficiency_snapshots (learner_id, created_at, composite, components)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    snapshot.learner_id,
                    snapshot.created_at,
                    snapshot.composite,
                    serde_json::to_string(&snapshot.components)
                        .map_err(|e| EngineError::Persistence(e.to_string()))?,
                ],
            )?;
        }

        if effects.decision.is_some() || effects.mastery.is_some() {
            let decisions_json: Option<String> = tx
                .query_row(
                    "SELECT decisions FROM unit_states WHERE learner_id = ?1 AND active = 1",
                    params![effects.learner_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(decisions_json) = decisions_json else {
                return Err(EngineError::Persistence(format!(
                    "no active unit state for learner {}",
                    effects.learner_id
                )));
            };
            let mut decisions: Vec<UnitDecisionRecord> =
                serde_json::from_str(&decisions_json).unwrap_or_default();
            if let Some(ref record) = effects.decision {
                decisions.push(record.clone());
            }
            tx.execute(
                "UPDATE unit_states SET decisions = ?2, mastery = COALESCE(?3, mastery)
                 WHERE learner_id = ?1 AND active = 1",
                params![
                    effects.learner_id,
                    serde_json::to_string(&decisions)
                        .map_err(|e| EngineError::Persistence(e.to_string()))?,
                    effects.mastery,
                ],
            )?;
        }

        if let Some(ref transition) = effects.transition {
            tx.execute(
                "UPDATE unit_states SET active = 0 WHERE learner_id = ?1 AND active = 1",
                params![effects.learner_id],
            )?;
            tx.execute(
                "INSERT INTO unit_states (learner_id, unit_index, entered_at, mastery, decisions, active)
                 VALUES (?1, ?2, ?3, 0, '[]', 1)",
                params![effects.learner_id, transition.to_unit, transition.at],
            )?;
            tx.execute(
                "UPDATE learner_profiles SET current_unit = ?2, unit_entered_at = ?3 WHERE id = ?1",
                params![effects.learner_id, transition.to_unit, transition.at],
            )?;
        }

        tx.commit()?;
        Ok(())
    }
}

/// 标注行的中间形态（分类校验前）
struct ErrorAnnotationRaw {
    turn_id: String,
    learner_id: String,
    surface_text: String,
    corrected_text: String,
    explanation: String,
    seq: u64,
    created_at: DateTime<Utc>,
}

const CARD_COLUMNS: &str = "SELECT learner_id, word, translation, example, introduced_unit, introduced_at, \
     ease_factor, interval_days, repetition_count, next_review, last_review, \
     successful_uses, graduated FROM vocabulary_cards";
