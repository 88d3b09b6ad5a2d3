//! `create_event` deduplicates on idempotency key regardless of payload.

use conductor::storage::Db;
use conductor::storage::models::EventClass;
use conductor::storage::events::{self, CreateEvent};

#[test]
fn second_call_returns_the_first_row_unchanged() {
    let db = Db::open_in_memory().unwrap();
    let conn = db.conn().unwrap();

    let first = events::create_event(
        &conn,
        CreateEvent {
            project_id: "proj_1",
            run_id: None,
            event_type: "issue.opened",
            class: EventClass::Fact,
            payload: serde_json::json!({ "title": "first payload" }),
            idempotency_key: "delivery_1",
            source: conductor::storage::models::EventSource::Webhook,
        },
    )
    .unwrap();

    let second = events::create_event(
        &conn,
        CreateEvent {
            project_id: "proj_1",
            run_id: None,
            event_type: "issue.opened",
            class: EventClass::Fact,
            payload: serde_json::json!({ "title": "a completely different payload" }),
            idempotency_key: "delivery_1",
            source: conductor::storage::models::EventSource::Webhook,
        },
    )
    .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.payload.get("title").and_then(|v| v.as_str()), Some("first payload"));

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM events WHERE idempotency_key = 'delivery_1'", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}
