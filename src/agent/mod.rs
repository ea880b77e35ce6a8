//! Privileged migration agent
//!
//! - `request`: typed parameters per operation, input validation
//! - `response`: success and sanitized error envelopes
//! - `handler`: dispatch, auditing and startup recovery
//! - `server`: Unix socket front end

mod errors;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;

pub use errors::{AgentError, AgentResult};
pub use handler::MigrationAgent;
pub use request::{AgentRequest, Envelope};
pub use response::{ErrorResponse, Response};
pub use server::serve;
