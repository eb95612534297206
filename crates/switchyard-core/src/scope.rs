use serde::{Deserialize, Serialize};

use crate::events::CanonicalEvent;
use crate::ids::RequestId;

/// Identity of one inbound request, passed explicitly through the pipeline
/// and to external collaborators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestScope {
    pub request_id: RequestId,
    pub platform: String,
    pub self_id: String,
    pub user_id: String,
    pub group_id: String,
}

impl RequestScope {
    pub fn from_event(event: &CanonicalEvent) -> Self {
        Self {
            request_id: RequestId::new(),
            platform: event.platform.clone(),
            self_id: event.self_id.clone(),
            user_id: event.user_id.clone(),
            group_id: event.group_id.clone(),
        }
    }

    /// `platform:user`, the session-context key suffix.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.platform, self.user_id)
    }
}
