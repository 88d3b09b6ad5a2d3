//! `conductor operator` — CLI front-end onto `operator::record_operator_action`.

use anyhow::{Context, Result};

use conductor::operator::{self, RecordOperatorAction};
use conductor::storage::Db;
use conductor::storage::models::OperatorActionKind;

pub fn cmd_operator(
    db_path: &std::path::Path,
    run_id: &str,
    action: &str,
    comment: Option<&str>,
) -> Result<()> {
    let action = OperatorActionKind::from_str(action)
        .with_context(|| format!("unknown operator action: {action}"))?;

    let db = Db::open(db_path)?;
    let mut conn = db.conn()?;

    operator::record_operator_action(
        &mut conn,
        RecordOperatorAction {
            run_id,
            action,
            actor_id: "cli",
            actor_type: "operator",
            actor_display_name: None,
            comment,
        },
    )?;

    println!("recorded {} on run {}", action.as_str(), run_id);
    Ok(())
}
