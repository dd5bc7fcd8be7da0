//! Filesystem-backed session store
//!
//! One JSON file per entry under the configured sessions root. Entry names
//! are digested before hitting the filesystem so arbitrary key names stay
//! path-safe.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::SessionStore;
use crate::error::Error;
use crate::models::SessionToken;
use crate::util::hash_token;

#[derive(Debug, Deserialize, Serialize)]
struct StoredEntry {
	expires: i64,
	value:   serde_json::Value,
}

/// A [`SessionStore`] persisting entries as files
#[derive(Clone, Debug)]
pub struct FileSessionStore {
	root: PathBuf,
}

impl FileSessionStore {
	#[must_use]
	pub fn new(root: &Path) -> Self {
		Self { root: root.to_path_buf() }
	}

	fn entry_path(&self, namespace: &str, name: &str) -> PathBuf {
		self.root.join(format!("{namespace}_{}.json", hash_token(name)))
	}

	async fn read_entry(
		&self,
		path: &Path,
	) -> Result<Option<StoredEntry>, Error> {
		let bytes = match tokio::fs::read(path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Ok(None);
			},
			Err(e) => return Err(e.into()),
		};

		let entry: StoredEntry = serde_json::from_slice(&bytes)?;

		if entry.expires <= Utc::now().timestamp_millis() {
			let _ = tokio::fs::remove_file(path).await;

			return Ok(None);
		}

		Ok(Some(entry))
	}

	async fn write_entry(
		&self,
		path: &Path,
		entry: &StoredEntry,
	) -> Result<(), Error> {
		tokio::fs::create_dir_all(&self.root).await?;
		tokio::fs::write(path, serde_json::to_vec(entry)?).await?;

		Ok(())
	}

	async fn remove_entries(
		&self,
		namespace: &str,
		names: &[String],
	) -> Result<usize, Error> {
		let mut removed = 0;

		for name in names {
			match tokio::fs::remove_file(self.entry_path(namespace, name)).await
			{
				Ok(()) => removed += 1,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
				Err(e) => return Err(e.into()),
			}
		}

		Ok(removed)
	}
}

#[async_trait]
impl SessionStore for FileSessionStore {
	async fn store_token(&self, token: &SessionToken) -> Result<(), Error> {
		let entry = StoredEntry {
			expires: token.expires,
			value:   serde_json::to_value(token)?,
		};

		self.write_entry(&self.entry_path("token", &token.key), &entry).await
	}

	async fn fetch_token(
		&self,
		key: &str,
	) -> Result<Option<SessionToken>, Error> {
		let Some(entry) = self.read_entry(&self.entry_path("token", key)).await?
		else {
			return Ok(None);
		};

		Ok(Some(serde_json::from_value(entry.value)?))
	}

	async fn delete_tokens(&self, keys: &[String]) -> Result<usize, Error> {
		self.remove_entries("token", keys).await
	}

	async fn store_key(
		&self,
		name: &str,
		ttl: u64,
		value: &str,
	) -> Result<(), Error> {
		let expires = Utc::now().timestamp_millis()
			+ i64::try_from(ttl).unwrap_or(i64::MAX / 2) * 1000;

		let entry =
			StoredEntry { expires, value: serde_json::Value::String(value.to_string()) };

		self.write_entry(&self.entry_path("key", name), &entry).await
	}

	async fn get_key(&self, name: &str) -> Result<Option<String>, Error> {
		let Some(entry) = self.read_entry(&self.entry_path("key", name)).await?
		else {
			return Ok(None);
		};

		match entry.value {
			serde_json::Value::String(value) => Ok(Some(value)),
			_ => Ok(None),
		}
	}

	async fn delete_keys(&self, names: &[String]) -> Result<usize, Error> {
		self.remove_entries("key", names).await
	}

	async fn quit(&self) -> Result<(), Error> {
		Ok(())
	}
}
