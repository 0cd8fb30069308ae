//! The unified MCP operation dispatcher for Oubliette.
//!
//! Every action a caller can take - creating a project, spawning a
//! session, sending a message, managing schedules and tokens - goes
//! through [`Dispatcher`]. Each method resolves a `(target, access)` pair
//! via [`scope::resolve_target`] and [`scope::authorize`] before touching
//! `oubliette-core`/`oubliette-scheduler` state, so the permission matrix
//! is enforced exactly once regardless of what wire framing (stdio/HTTP
//! MCP) a transport layer puts on top of it.
//!
//! This crate owns no transport of its own; it defines the wire-facing
//! request/response types ([`ops`]) and error shape ([`error`]) that a
//! transport maps frames onto.

pub mod dispatcher;
pub mod error;
pub mod ops;
pub mod scope;

pub use dispatcher::{DefaultLimits, Dispatcher, NotificationHub};
pub use error::{DispatchError, DispatchResult, ErrorCode};
pub use ops::Notification;
