//! Narrow contracts to subsystems that live outside the gateway.
//!
//! The gateway only asks questions through these traits. The defaults admit
//! everything and never short-circuit dispatch.

use std::sync::Arc;

use async_trait::async_trait;

use switchyard_core::{CanonicalEvent, RequestScope};

use crate::errors::Result;
use crate::routing::RouteDecision;
use crate::session_ctx::SessionContext;

/// Reason that still lets admin commands through.
pub const SYSTEM_CLOSED: &str = "system_closed";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub reason: String,
}

impl Admission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: String::new(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }

    pub fn is_system_closed(&self) -> bool {
        self.reason == SYSTEM_CLOSED
    }
}

/// Everything an interceptor sees right before dispatch.
#[derive(Debug)]
pub struct DispatchContext<'a> {
    pub event: &'a CanonicalEvent,
    pub scope: &'a RequestScope,
    pub session: Option<&'a SessionContext>,
    pub route: &'a RouteDecision,
}

/// Identity handed to the digital-employee responder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmployeeIdentity {
    pub platform: String,
    pub self_id: String,
    pub user_id: String,
    pub group_id: String,
}

impl EmployeeIdentity {
    pub fn from_scope(scope: &RequestScope) -> Self {
        Self {
            platform: scope.platform.clone(),
            self_id: scope.self_id.clone(),
            user_id: scope.user_id.clone(),
            group_id: scope.group_id.clone(),
        }
    }
}

#[async_trait]
pub trait AdmissionPolicy: Send + Sync {
    async fn process_message(
        &self,
        event: &CanonicalEvent,
        scope: &RequestScope,
    ) -> Result<Admission>;
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    /// `false` suppresses dispatch.
    async fn process_before_dispatch(&self, ctx: &DispatchContext<'_>) -> bool;
}

#[async_trait]
pub trait EmployeeResponder: Send + Sync {
    /// A non-empty reply is sent straight back to the Bot.
    async fn chat_with_employee(
        &self,
        identity: &EmployeeIdentity,
        event: &CanonicalEvent,
    ) -> Result<Option<String>>;
}

pub struct AllowAll;

#[async_trait]
impl AdmissionPolicy for AllowAll {
    async fn process_message(&self, _: &CanonicalEvent, _: &RequestScope) -> Result<Admission> {
        Ok(Admission::allow())
    }
}

pub struct PassThrough;

#[async_trait]
impl Interceptor for PassThrough {
    async fn process_before_dispatch(&self, _: &DispatchContext<'_>) -> bool {
        true
    }
}

pub struct NoEmployee;

#[async_trait]
impl EmployeeResponder for NoEmployee {
    async fn chat_with_employee(
        &self,
        _: &EmployeeIdentity,
        _: &CanonicalEvent,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub admission: Arc<dyn AdmissionPolicy>,
    pub interceptor: Arc<dyn Interceptor>,
    pub employee: Arc<dyn EmployeeResponder>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            admission: Arc::new(AllowAll),
            interceptor: Arc::new(PassThrough),
            employee: Arc::new(NoEmployee),
        }
    }
}
