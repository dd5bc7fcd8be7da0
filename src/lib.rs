//! User & session core for CouchDB-style document stores
//!
//! Owns account lifecycle (local and federated), credential validation,
//! session issuance and revocation, per-user database provisioning, and
//! activity auditing. HTTP routing, OAuth handshakes, and configuration
//! loading are external collaborators.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod dbauth;
pub mod error;
pub mod events;
pub mod mailer;
pub mod models;
pub mod session;
pub mod store;
pub mod strategies;
pub mod user;
pub mod util;
pub mod validate;

pub use config::Config;
pub use dbauth::DbAuth;
pub use error::Error;
pub use events::{AuthEvent, EventBus};
pub use mailer::{Mailer, StubMailbox};
pub use models::{RequestContext, SessionResponse, SessionToken, UserDoc};
pub use session::SessionStore;
pub use store::{DocumentServer, UserStore};
pub use user::UserService;
