//! Profe - Rust 西班牙语陪练引擎
//!
//! 入口：初始化日志、加载配置、装配引擎，并运行一个标准输入聊天循环
//! （本地调试用传输层；正式传输层按 §外部接口 另行接入）。

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use profe::config::load_config;
use profe::llm::{LlmErrorDetector, OpenAiClient};
use profe::session::TutorEngine;
use profe::store::TutorStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    profe::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;

    let db_path = cfg
        .app
        .db_path
        .clone()
        .unwrap_or_else(|| "data/profe.sqlite".into());
    if let Some(parent) = db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = Arc::new(TutorStore::open(&db_path).context("Failed to open store")?);

    let llm = Arc::new(
        OpenAiClient::new(cfg.llm.base_url.as_deref(), &cfg.llm.model, None)
            .with_params(cfg.llm.temperature, cfg.llm.max_tokens),
    );
    let detector = Arc::new(LlmErrorDetector::new(llm.clone(), cfg.correction.max_per_turn));
    let engine = TutorEngine::new(cfg, store.clone(), llm, detector);

    let learner_id = std::env::var("PROFE_LEARNER").unwrap_or_else(|_| "local".to_string());
    let display_name = std::env::var("PROFE_NAME").unwrap_or_else(|_| "estudiante".to_string());

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all("Profe lista. Escribe en español (/repaso para tarjetas, /salto para aceptar un salto de unidad, /prefiere clave=valor, /olvidame, /adios para salir).\n".as_bytes())
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut reviewing = false;
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/adios" {
            break;
        }

        let now = Utc::now();
        let reply = if text == "/repaso" {
            match engine.start_review(&learner_id, now).await? {
                Some(session) => {
                    reviewing = true;
                    match session.current_card() {
                        Some(card) => format!(
                            "Repaso: ¿recuerdas \"{}\"? Califícate de 0 a 5.",
                            card.word
                        ),
                        None => "No hay tarjetas pendientes hoy.".to_string(),
                    }
                }
                None => "No hay tarjetas pendientes hoy.".to_string(),
            }
        } else if let Some(pref) = text.strip_prefix("/prefiere ") {
            match pref.split_once('=') {
                Some((key, value)) => {
                    store.set_preference(&learner_id, key.trim(), value.trim()).await?;
                    format!("Anotado: {} = {}.", key.trim(), value.trim())
                }
                None => "Uso: /prefiere clave=valor".to_string(),
            }
        } else if text == "/olvidame" {
            store.erase_learner(&learner_id).await?;
            "He borrado todos tus datos. ¡Hasta pronto!".to_string()
        } else if text == "/salto" {
            if engine.accept_skip(&learner_id, now).await? {
                "¡Hecho! Pasamos a la siguiente unidad.".to_string()
            } else {
                "Ahora mismo no hay ninguna invitación de salto pendiente.".to_string()
            }
        } else if reviewing && text.len() == 1 && text.chars().all(|c| c.is_ascii_digit()) {
            let quality: u8 = text.parse().unwrap_or(0);
            match engine.grade_review(&learner_id, quality, now).await? {
                Some((card, remaining)) if remaining > 0 => format!(
                    "\"{}\" vuelve en {} día(s). Quedan {}.",
                    card.word, card.interval_days, remaining
                ),
                Some((card, _)) => {
                    reviewing = false;
                    format!("\"{}\" vuelve en {} día(s). ¡Repaso terminado!", card.word, card.interval_days)
                }
                None => {
                    reviewing = false;
                    "El repaso ya había terminado.".to_string()
                }
            }
        } else {
            let outcome = engine.learner_turn(&learner_id, &display_name, text, now).await?;
            outcome.reply
        };

        stdout.write_all(format!("profe> {reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}
