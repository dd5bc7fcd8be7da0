//! In-process document store adapters
//!
//! Interpret the `auth/*` views natively so the full core can run without a
//! backing database, mirroring the view definitions produced by
//! [`crate::util::auth_design_doc`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DocumentServer, UserStore};
use crate::error::{Error, InternalError};
use crate::models::{
	ApiKey,
	DesignDoc,
	KeyRecord,
	SecurityDoc,
	UserDoc,
};
use crate::util::{key_uuid, url_safe_uuid};

/// A [`UserStore`] holding documents in process memory
#[derive(Debug, Default)]
pub struct MemoryUserStore {
	docs:        Mutex<HashMap<String, UserDoc>>,
	design_docs: Mutex<HashMap<String, DesignDoc>>,
}

impl MemoryUserStore {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	fn next_rev(rev: Option<&String>) -> String {
		let generation = rev
			.and_then(|rev| rev.split('-').next())
			.and_then(|generation| generation.parse::<u64>().ok())
			.unwrap_or(0);

		format!("{}-{}", generation + 1, Uuid::new_v4().simple())
	}

	fn view_matches(view: &str, key: &str, doc: &UserDoc) -> bool {
		match view {
			"username" => doc.username.as_deref() == Some(key),
			"email" => {
				doc.email.as_deref() == Some(key)
					|| doc
						.unverified_email
						.as_ref()
						.is_some_and(|u| u.email == key)
			},
			"phone" => doc.phone.as_deref() == Some(key),
			"emailUsername" => {
				doc.email.as_deref() == Some(key)
					|| doc.username.as_deref() == Some(key)
					|| doc
						.unverified_email
						.as_ref()
						.is_some_and(|u| u.email == key)
			},
			"passwordReset" => {
				doc.forgot_password.as_ref().is_some_and(|f| f.token == key)
			},
			"verifyEmail" => {
				doc.unverified_email.as_ref().is_some_and(|u| u.token == key)
			},
			"session" => doc.session.contains_key(key),
			provider => {
				doc.provider_info(provider)
					.and_then(|info| {
						info.profile.get("id").map(|id| match id {
							serde_json::Value::String(id) => id == key,
							other => other.to_string() == key,
						})
					})
					.unwrap_or(false)
			},
		}
	}
}

#[async_trait]
impl UserStore for MemoryUserStore {
	async fn get(&self, id: &str) -> Result<Option<UserDoc>, Error> {
		Ok(self.docs.lock().get(id).cloned())
	}

	async fn put(&self, doc: &mut UserDoc) -> Result<(), Error> {
		if doc.id.is_empty() {
			return Err(InternalError::StoreError(
				"cannot store a document without an _id".to_string(),
			)
			.into());
		}

		let mut docs = self.docs.lock();

		if let Some(stored) = docs.get(&doc.id)
			&& stored.rev != doc.rev
		{
			return Err(Error::RevisionConflict);
		}

		doc.rev = Some(Self::next_rev(doc.rev.as_ref()));
		docs.insert(doc.id.clone(), doc.clone());

		Ok(())
	}

	async fn remove(&self, id: &str, rev: &str) -> Result<(), Error> {
		let mut docs = self.docs.lock();

		match docs.get(id) {
			Some(stored) if stored.rev.as_deref() == Some(rev) => {
				docs.remove(id);

				Ok(())
			},
			Some(_) => Err(Error::RevisionConflict),
			None => Ok(()),
		}
	}

	async fn query_view(
		&self,
		view: &str,
		key: &str,
	) -> Result<Vec<UserDoc>, Error> {
		let docs = self.docs.lock();

		Ok(docs
			.values()
			.filter(|doc| Self::view_matches(view, key, doc))
			.cloned()
			.collect())
	}

	async fn id_range(
		&self,
		start: &str,
		end: &str,
	) -> Result<Vec<String>, Error> {
		let docs = self.docs.lock();

		let mut ids: Vec<String> = docs
			.keys()
			.filter(|id| id.as_str() >= start && id.as_str() < end)
			.cloned()
			.collect();
		ids.sort();

		Ok(ids)
	}

	async fn ensure_design_doc(&self, doc: &DesignDoc) -> Result<(), Error> {
		self.design_docs.lock().insert(doc.id.clone(), doc.clone());

		Ok(())
	}
}

#[derive(Debug, Default)]
struct DbState {
	security:    SecurityDoc,
	design_docs: HashMap<String, DesignDoc>,
}

/// A [`DocumentServer`] over in-process state
#[derive(Debug, Default)]
pub struct MemoryServer {
	dbs:            Mutex<HashMap<String, DbState>>,
	keys:           Mutex<HashMap<String, KeyRecord>>,
	/// Mint API keys like a Cloudant-style backend would
	generates_keys: bool,
}

impl MemoryServer {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// A server whose `generate_api_key` mints keys, exercising the
	/// service-generated-credentials branch
	#[must_use]
	pub fn with_api_keys() -> Self {
		Self { generates_keys: true, ..Self::default() }
	}

	/// All stored credential keys, for inspection in tests
	#[must_use]
	pub fn key_names(&self) -> Vec<String> {
		self.keys.lock().keys().cloned().collect()
	}

	/// A database's current security document, for inspection in tests
	#[must_use]
	pub fn security_of(&self, db: &str) -> Option<SecurityDoc> {
		self.dbs.lock().get(db).map(|state| state.security.clone())
	}
}

#[async_trait]
impl DocumentServer for MemoryServer {
	async fn create_db(&self, name: &str) -> Result<bool, Error> {
		let mut dbs = self.dbs.lock();

		if dbs.contains_key(name) {
			return Ok(false);
		}

		dbs.insert(name.to_string(), DbState::default());

		Ok(true)
	}

	async fn destroy_db(&self, name: &str) -> Result<(), Error> {
		self.dbs.lock().remove(name);

		Ok(())
	}

	async fn db_exists(&self, name: &str) -> Result<bool, Error> {
		Ok(self.dbs.lock().contains_key(name))
	}

	async fn get_security(&self, db: &str) -> Result<SecurityDoc, Error> {
		Ok(self
			.dbs
			.lock()
			.get(db)
			.map(|state| state.security.clone())
			.unwrap_or_default())
	}

	async fn put_security(
		&self,
		db: &str,
		doc: &SecurityDoc,
	) -> Result<(), Error> {
		let mut dbs = self.dbs.lock();
		let state = dbs.entry(db.to_string()).or_default();
		state.security = doc.clone();

		Ok(())
	}

	async fn put_design_doc(
		&self,
		db: &str,
		doc: &DesignDoc,
	) -> Result<(), Error> {
		let mut dbs = self.dbs.lock();
		let state = dbs.entry(db.to_string()).or_default();
		state.design_docs.insert(doc.id.clone(), doc.clone());

		Ok(())
	}

	async fn store_key_record(&self, record: &KeyRecord) -> Result<(), Error> {
		self.keys.lock().insert(record.key.clone(), record.clone());

		Ok(())
	}

	async fn remove_key_records(&self, keys: &[String]) -> Result<(), Error> {
		let mut stored = self.keys.lock();

		for key in keys {
			stored.remove(key);
		}

		Ok(())
	}

	async fn expired_key_records(
		&self,
		now: i64,
	) -> Result<Vec<String>, Error> {
		Ok(self
			.keys
			.lock()
			.values()
			.filter(|record| record.expires < now)
			.map(|record| record.key.clone())
			.collect())
	}

	async fn generate_api_key(&self) -> Result<Option<ApiKey>, Error> {
		if !self.generates_keys {
			return Ok(None);
		}

		Ok(Some(ApiKey { key: key_uuid(), password: url_safe_uuid() }))
	}
}
