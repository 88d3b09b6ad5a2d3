//! Opaque, entity-prefixed identifiers: a short prefix naming the entity
//! kind (e.g. `run_`, `evt_`) plus a trimmed v4 UUID (no hyphens).

use uuid::Uuid;

fn short() -> String {
    Uuid::new_v4().simple().to_string()
}

macro_rules! id_kind {
    ($name:ident, $prefix:literal) => {
        pub fn $name() -> String {
            format!(concat!($prefix, "_{}"), short())
        }
    };
}

id_kind!(user_id, "usr");
id_kind!(project_id, "proj");
id_kind!(repo_id, "repo");
id_kind!(task_id, "task");
id_kind!(run_id, "run");
id_kind!(event_id, "evt");
id_kind!(artifact_id, "art");
id_kind!(job_id, "job");
id_kind!(invocation_id, "inv");
id_kind!(message_id, "msg");
id_kind!(tool_invocation_id, "tool");
id_kind!(operator_action_id, "act");
id_kind!(outbox_id, "ghw");
id_kind!(worktree_id, "wt");
id_kind!(port_lease_id, "port");
id_kind!(deferred_event_id, "mde");
