pub mod balancer;
pub mod collaborators;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod health;
pub mod heartbeat;
pub mod limiter;
pub mod observe;
pub mod pool;
pub mod registry;
pub mod routing;
pub mod server;
pub mod session_ctx;
pub mod shutdown;
pub mod socket;

pub use collaborators::{
    Admission, AdmissionPolicy, Collaborators, DispatchContext, EmployeeIdentity,
    EmployeeResponder, Interceptor,
};
pub use dispatch::DispatchOutcome;
pub use errors::GatewayError;
pub use gateway::{Gateway, PipelineOutcome};
pub use routing::RouteDecision;
pub use server::{build_router, start, AppState, ServerHandle};
