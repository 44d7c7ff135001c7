use std::fs;
use std::path::Path;

use anyhow::Result;
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};

use crate::config::{PackConfig, Secret};
use crate::generate::generate;

/// 2024-05-01T10:00:00Z
pub(crate) fn fixture_time() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_714_557_600)
}

/// Authored question pack in the legacy item shape, one list entry per round.
pub(crate) fn question_template() -> Value {
    let legacy_item = |round: usize, n: usize| {
        json!({
            "question": format!("Round {round} question {n}?"),
            "correct_answer": format!("Answer {round}.{n}"),
            "distractors": {"easy": format!("Easy {round}.{n}"), "medium": format!("Medium {round}.{n}")}
        })
    };
    let rounds = (1..=5)
        .map(|round| {
            json!({
                "round": round,
                "hostItems": (1..=3).map(|n| legacy_item(round, n)).collect::<Vec<_>>(),
                "guestItems": (4..=6).map(|n| legacy_item(round, n)).collect::<Vec<_>>(),
                "interlude": format!("Interlude {round}")
            })
        })
        .collect::<Vec<_>>();
    json!({"version": "jemima-questionpack-1", "meta": {"roomCode": "AAA"}, "rounds": rounds})
}

pub(crate) fn maths_template() -> Value {
    json!({
        "version": "jemima-maths-chain-2",
        "meta": {"roomCode": "AAA"},
        "maths": {
            "clues": ["Start with 3", "Double it", "Add 4", "Halve it", "Add 10"],
            "reveals": ["3", "6", "10", "5", {"prompt": "15"}],
            "question": "Where do you end up?",
            "answer": "15"
        }
    })
}

pub(crate) fn write_templates(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(dir.join("AAA-questions.json"), serde_json::to_vec_pretty(&question_template())?)?;
    fs::write(dir.join("AAA-maths.json"), serde_json::to_vec_pretty(&maths_template())?)?;
    Ok(())
}

/// Config rooted in `root` with a cheap KDF.
pub(crate) fn test_config(root: &Path) -> PackConfig {
    PackConfig {
        password: Secret::new("DEMO-ONLY"),
        pbkdf2_iterations: 1_000,
        pool_dir: root.join("packs"),
        templates_dir: root.join("templates"),
        rooms_db: root.join("rooms.sqlite3"),
        ..PackConfig::default()
    }
}

/// Generate `pairs` pairs into the pool of `config`, one minute apart.
pub(crate) fn fill_pool(config: &PackConfig, pairs: i64) -> Result<()> {
    write_templates(&config.templates_dir)?;
    for minute in 0..pairs {
        generate(config, &config.pool().new_dir(), fixture_time() + Duration::minutes(minute))?;
    }
    Ok(())
}
