//! `record_operator_action` refuses an action that doesn't fit the run's
//! current phase, and clears `tasks.active_run_id` once the run is
//! cancelled.

use conductor::storage::Db;
use conductor::storage::models::{OperatorActionKind, Phase};
use conductor::storage::runs::{self, CreateRun};
use conductor::operator::{self, RecordOperatorAction};

fn seed(conn: &rusqlite::Connection) {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO users (id, email, created_at) VALUES ('user_1','a@example.com', ?1)",
        [&now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO projects (id, user_id, name, org_installation_id, port_range_start, port_range_end, default_policy_set_id, created_at)
         VALUES ('proj_1','user_1','demo','install_1',20000,20999,'default', ?1)",
        [&now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO repos (id, project_id, upstream_node_id, created_at) VALUES ('repo_1','proj_1','node_repo_1', ?1)",
        [&now],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO tasks (id, project_id, upstream_node_id, title, created_at, updated_at, last_activity_at)
         VALUES ('task_1','proj_1','node_task_1','fix the bug', ?1, ?1, ?1)",
        [&now],
    )
    .unwrap();
}

#[test]
fn approve_plan_rejected_on_pending_run_but_cancel_succeeds() {
    let db = Db::open_in_memory().unwrap();
    let mut conn = db.conn().unwrap();
    seed(&conn);

    let run = runs::create_run(
        &conn,
        CreateRun {
            task_id: "task_1",
            project_id: "proj_1",
            repo_id: "repo_1",
            policy_set_id: "default",
            base_branch: "main",
        },
    )
    .unwrap();
    assert_eq!(run.phase, Phase::Pending);

    let err = operator::record_operator_action(
        &mut conn,
        RecordOperatorAction {
            run_id: &run.id,
            action: OperatorActionKind::ApprovePlan,
            actor_id: "op_1",
            actor_type: "operator",
            actor_display_name: None,
            comment: None,
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("awaiting_plan_approval"));

    operator::record_operator_action(
        &mut conn,
        RecordOperatorAction {
            run_id: &run.id,
            action: OperatorActionKind::Cancel,
            actor_id: "op_1",
            actor_type: "operator",
            actor_display_name: None,
            comment: Some("no longer needed"),
        },
    )
    .unwrap();

    let updated = runs::get_run(&conn, &run.id).unwrap().unwrap();
    assert_eq!(updated.phase, Phase::Cancelled);

    let active_run_id: Option<String> = conn
        .query_row("SELECT active_run_id FROM tasks WHERE id = 'task_1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(active_run_id, None);
}
