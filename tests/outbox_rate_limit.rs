//! `mirror_comment` coalesces comments posted within the rate-limit window
//! and flushes them, in order, once the window has passed.

use conductor::storage::Db;
use conductor::outbox;

fn seed_run(conn: &rusqlite::Connection) {
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
    conn.execute(
        "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
         VALUES ('run_1','task_1','proj_1','repo_1','default',1,'executing','main','b', ?1)",
        [&now],
    )
    .unwrap();
}

/// Seeds a completed `comment` github_writes row `created_at` seconds ago,
/// standing in for a prior flush that the 30s window measures from.
fn seed_prior_comment(conn: &rusqlite::Connection, seconds_ago: i64) {
    let created_at = (chrono::Utc::now() - chrono::Duration::seconds(seconds_ago)).to_rfc3339();
    conn.execute(
        "INSERT INTO github_writes (id, run_id, kind, target_node_id, target_type, payload, payload_hash, idempotency_key, status, retry_count, created_at)
         VALUES ('gw_0','run_1','comment','issue_1','issue','{}','hash_0','idem_0','completed',0, ?1)",
        [&created_at],
    )
    .unwrap();
}

#[test]
fn two_calls_within_the_window_defer_then_a_third_flushes_them_in_order() {
    let db = Db::open_in_memory().unwrap();
    let conn = db.conn().unwrap();
    seed_run(&conn);
    seed_prior_comment(&conn, 10);

    let first = outbox::mirror_comment(&conn, "run_1", "issue_1", "plan revised");
    assert!(!first.enqueued);
    assert!(first.deferred);

    let second = outbox::mirror_comment(&conn, "run_1", "issue_1", "tests passing");
    assert!(!second.enqueued);
    assert!(second.deferred);

    let write_count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM github_writes WHERE run_id = 'run_1' AND id != 'gw_0'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(write_count, 0);

    let deferred_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM mirror_deferred_events WHERE run_id = 'run_1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(deferred_count, 2);

    // Move the prior comment outside the window so the next call flushes.
    let past = (chrono::Utc::now() - chrono::Duration::seconds(45)).to_rfc3339();
    conn.execute("UPDATE github_writes SET created_at = ?1 WHERE id = 'gw_0'", [&past]).unwrap();

    let third = outbox::mirror_comment(&conn, "run_1", "issue_1", "PR opened");
    assert!(third.enqueued);
    assert!(!third.deferred);

    let body: String = conn
        .query_row(
            "SELECT payload FROM github_writes WHERE run_id = 'run_1' AND id != 'gw_0'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    let payload: serde_json::Value = serde_json::from_str(&body).unwrap();
    let body_text = payload.get("body").and_then(|v| v.as_str()).unwrap_or_default();
    let plan_idx = body_text.find("plan revised").unwrap();
    let tests_idx = body_text.find("tests passing").unwrap();
    let pr_idx = body_text.find("PR opened").unwrap();
    assert!(plan_idx < tests_idx && tests_idx < pr_idx);

    let deferred_count_after: i64 = conn
        .query_row("SELECT COUNT(*) FROM mirror_deferred_events WHERE run_id = 'run_1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(deferred_count_after, 0);
}
