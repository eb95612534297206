//! Key namespaces shared by every store user.

pub const ROUTING_RULES: &str = "routing:rules";
pub const RATELIMIT_CONFIG: &str = "ratelimit:config";
pub const DEFAULT_QUEUE: &str = "queue:default";

pub fn idempotency(identity: &str) -> String {
    format!("idem:{identity}")
}

pub fn rate_user(user_id: &str) -> String {
    format!("rate:user:{user_id}")
}

pub fn rate_group(group_id: &str) -> String {
    format!("rate:group:{group_id}")
}

pub fn session(platform: &str, user_id: &str) -> String {
    format!("session:{platform}:{user_id}")
}

pub fn session_state(platform: &str, user_id: &str, key: &str) -> String {
    format!("session_state:{platform}:{user_id}:{key}")
}

pub fn worker_caps(worker_id: &str) -> String {
    format!("worker:caps:{worker_id}")
}

pub fn worker_queue(worker_id: &str) -> String {
    format!("queue:worker:{worker_id}")
}

/// Worker id of a per-worker queue name.
pub fn queue_worker_id(queue: &str) -> Option<&str> {
    queue.strip_prefix("queue:worker:")
}
