//! In-process session store, mainly for tests and single-node setups

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::SessionStore;
use crate::error::Error;
use crate::models::SessionToken;

#[derive(Debug, Default)]
struct Entries {
	tokens: HashMap<String, SessionToken>,
	keys:   HashMap<String, NamedKey>,
}

#[derive(Clone, Debug)]
struct NamedKey {
	value:   String,
	expires: i64,
}

/// A [`SessionStore`] holding everything in process memory
#[derive(Debug, Default)]
pub struct MemorySessionStore {
	entries: Mutex<Entries>,
}

impl MemorySessionStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl SessionStore for MemorySessionStore {
	async fn store_token(&self, token: &SessionToken) -> Result<(), Error> {
		let mut entries = self.entries.lock();
		entries.tokens.insert(token.key.clone(), token.clone());

		Ok(())
	}

	async fn fetch_token(
		&self,
		key: &str,
	) -> Result<Option<SessionToken>, Error> {
		let now = Utc::now().timestamp_millis();
		let mut entries = self.entries.lock();

		match entries.tokens.get(key) {
			Some(token) if token.expires > now => Ok(Some(token.clone())),
			Some(_) => {
				entries.tokens.remove(key);

				Ok(None)
			},
			None => Ok(None),
		}
	}

	async fn delete_tokens(&self, keys: &[String]) -> Result<usize, Error> {
		let mut entries = self.entries.lock();

		Ok(keys
			.iter()
			.filter(|key| entries.tokens.remove(*key).is_some())
			.count())
	}

	async fn store_key(
		&self,
		name: &str,
		ttl: u64,
		value: &str,
	) -> Result<(), Error> {
		let expires = Utc::now().timestamp_millis()
			+ i64::try_from(ttl).unwrap_or(i64::MAX / 2) * 1000;

		let mut entries = self.entries.lock();
		entries
			.keys
			.insert(name.to_string(), NamedKey { value: value.to_string(), expires });

		Ok(())
	}

	async fn get_key(&self, name: &str) -> Result<Option<String>, Error> {
		let now = Utc::now().timestamp_millis();
		let mut entries = self.entries.lock();

		match entries.keys.get(name) {
			Some(key) if key.expires > now => Ok(Some(key.value.clone())),
			Some(_) => {
				entries.keys.remove(name);

				Ok(None)
			},
			None => Ok(None),
		}
	}

	async fn delete_keys(&self, names: &[String]) -> Result<usize, Error> {
		let mut entries = self.entries.lock();

		Ok(names
			.iter()
			.filter(|name| entries.keys.remove(*name).is_some())
			.count())
	}

	async fn quit(&self) -> Result<(), Error> {
		Ok(())
	}
}
