//! Canonical data model shared by every switchyard crate.
//!
//! Bots and Workers speak versioned variants of a chat-platform protocol.
//! Everything entering the gateway is normalized into [`CanonicalEvent`] or
//! [`CanonicalAction`] here, before any routing decision is made.

pub mod capability;
pub mod errors;
pub mod events;
pub mod ids;
pub mod normalize;
pub mod scope;
pub mod segment;

pub use capability::{Capability, CapabilityRegistration};
pub use errors::NormalizeError;
pub use events::{ActionResponse, CanonicalAction, CanonicalEvent, EventKind, Extension};
pub use ids::{ConnId, RequestId};
pub use normalize::{
    render_action, render_event, BotFrame, BotIdentity, Normalizer, ProtocolVersion, WorkerFrame,
};
pub use scope::RequestScope;
pub use segment::Segment;
