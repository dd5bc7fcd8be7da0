//! Redis-backed session store

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::SessionStore;
use crate::error::Error;
use crate::models::SessionToken;

/// A [`SessionStore`] backed by a shared redis connection
#[derive(Clone)]
pub struct RedisSessionStore {
	conn: ConnectionManager,
}

impl RedisSessionStore {
	/// Connect to the configured redis server
	///
	/// # Errors
	/// Fails if the server is unreachable
	pub async fn connect(url: &str) -> Result<Self, Error> {
		let client = redis::Client::open(url)?;
		let conn = ConnectionManager::new(client).await?;

		Ok(Self { conn })
	}

	fn token_key(key: &str) -> String {
		format!("token:{key}")
	}
}

#[async_trait]
impl SessionStore for RedisSessionStore {
	async fn store_token(&self, token: &SessionToken) -> Result<(), Error> {
		let ttl = (token.expires - Utc::now().timestamp_millis()) / 1000;

		if ttl <= 0 {
			return Ok(());
		}

		let mut conn = self.conn.clone();
		let data = serde_json::to_string(token)?;

		let _: () = conn
			.set_ex(Self::token_key(&token.key), data, ttl.unsigned_abs())
			.await?;

		Ok(())
	}

	async fn fetch_token(
		&self,
		key: &str,
	) -> Result<Option<SessionToken>, Error> {
		let mut conn = self.conn.clone();
		let data: Option<String> = conn.get(Self::token_key(key)).await?;

		let Some(data) = data else {
			return Ok(None);
		};

		Ok(Some(serde_json::from_str(&data)?))
	}

	async fn delete_tokens(&self, keys: &[String]) -> Result<usize, Error> {
		if keys.is_empty() {
			return Ok(0);
		}

		let mut conn = self.conn.clone();
		let keys: Vec<String> =
			keys.iter().map(|key| Self::token_key(key)).collect();

		let removed: usize = conn.del(keys).await?;

		Ok(removed)
	}

	async fn store_key(
		&self,
		name: &str,
		ttl: u64,
		value: &str,
	) -> Result<(), Error> {
		let mut conn = self.conn.clone();

		// SETEX rejects a zero expiry; a dead-on-arrival key is a delete
		if ttl == 0 {
			let _: usize = conn.del(name).await?;

			return Ok(());
		}

		let _: () = conn.set_ex(name, value, ttl).await?;

		Ok(())
	}

	async fn get_key(&self, name: &str) -> Result<Option<String>, Error> {
		let mut conn = self.conn.clone();
		let value: Option<String> = conn.get(name).await?;

		Ok(value)
	}

	async fn delete_keys(&self, names: &[String]) -> Result<usize, Error> {
		if names.is_empty() {
			return Ok(0);
		}

		let mut conn = self.conn.clone();
		let removed: usize = conn.del(names.to_vec()).await?;

		Ok(removed)
	}

	async fn quit(&self) -> Result<(), Error> {
		// ConnectionManager closes its connections on drop
		Ok(())
	}
}
