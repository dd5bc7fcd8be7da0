//! Short-lived session token and named key storage
//!
//! All adapters are behaviorally indistinguishable: expired entries are
//! never returned, and `confirm_token` only succeeds for a live token with
//! a matching password.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, LoginError};
use crate::models::{SessionToken, SessionUser};

mod file;
mod memory;
mod redis;

pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use redis::RedisSessionStore;

/// Pluggable KV for session tokens and short-lived named keys
#[async_trait]
pub trait SessionStore: Send + Sync {
	/// Store a token record until its `expires` timestamp
	async fn store_token(&self, token: &SessionToken) -> Result<(), Error>;

	/// Fetch a live token record by key
	async fn fetch_token(&self, key: &str)
	-> Result<Option<SessionToken>, Error>;

	/// Delete token records; returns how many existed
	async fn delete_tokens(&self, keys: &[String]) -> Result<usize, Error>;

	/// Store a named key (e.g. an invite code) for `ttl` seconds
	async fn store_key(
		&self,
		name: &str,
		ttl: u64,
		value: &str,
	) -> Result<(), Error>;

	/// Fetch a live named key
	async fn get_key(&self, name: &str) -> Result<Option<String>, Error>;

	/// Delete named keys; returns how many existed
	async fn delete_keys(&self, names: &[String]) -> Result<usize, Error>;

	/// Release any underlying connections
	async fn quit(&self) -> Result<(), Error>;

	/// Validate a token key/password pair and return the minimal user view
	async fn confirm_token(
		&self,
		key: &str,
		password: &str,
	) -> Result<SessionUser, Error> {
		let Some(token) = self.fetch_token(key).await? else {
			return Err(LoginError::Unauthorized.into());
		};

		if token.expires <= Utc::now().timestamp_millis()
			|| token.password != password
		{
			return Err(LoginError::Unauthorized.into());
		}

		Ok(SessionUser {
			id:    token.user_id,
			roles: token.roles,
			key:   token.key,
		})
	}
}
