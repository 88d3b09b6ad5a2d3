//! A run's happy path from creation through its first phase transition.

use conductor::storage::Db;
use conductor::storage::models::Phase;
use conductor::storage::runs::{self, CreateRun};
use conductor::orchestrator::{self, TransitionPhase};

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
fn run_creation_and_first_transition() {
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
    assert_eq!(run.run_number, 1);
    assert_eq!(run.next_sequence, 1);
    assert_eq!(run.policy_set_id, "default");

    let updated = orchestrator::transition_phase(
        &mut conn,
        TransitionPhase {
            run_id: &run.id,
            to: Phase::Planning,
            triggered_by: "system",
            reason: None,
            payload: None,
            next_step: Some(conductor::steps::STEP_SETUP_WORKTREE),
            blocked_context: None,
        },
    )
    .unwrap();

    assert_eq!(updated.phase, Phase::Planning);
    assert_eq!(updated.next_sequence, 2);

    let events = conductor::storage::events::list_events_for_run(&conn, &run.id).unwrap();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.sequence, Some(1));
    assert_eq!(event.payload.get("from").and_then(|v| v.as_str()), Some("pending"));
    assert_eq!(event.payload.get("to").and_then(|v| v.as_str()), Some("planning"));
}
