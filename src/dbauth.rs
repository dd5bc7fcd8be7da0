//! Per-user database provisioning and credential management

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{Config, DbModelConfig};
use crate::error::Error;
use crate::models::{
	DbType,
	DesignDoc,
	KeyRecord,
	PersonalDb,
	SecurityDoc,
	SessionToken,
	UserDoc,
};
use crate::store::DocumentServer;
use crate::util::{hash_password, key_uuid, url_safe_uuid};

/// Resolved configuration for a single personal DB
#[derive(Clone, Debug)]
pub struct DbConfig {
	pub name:         String,
	pub db_type:      DbType,
	pub permissions:  Option<Vec<String>>,
	pub admin_roles:  Vec<String>,
	pub member_roles: Vec<String>,
	pub design_docs:  Vec<String>,
}

/// Manages per-user databases and the DB auth store
#[derive(Clone)]
pub struct DbAuth {
	config: Arc<Config>,
	server: Arc<dyn DocumentServer>,
}

impl DbAuth {
	#[must_use]
	pub fn new(config: Arc<Config>, server: Arc<dyn DocumentServer>) -> Self {
		Self { config, server }
	}

	/// Resolve the configuration of a DB by merging the `_default` model
	/// entry with the DB's own entry
	#[must_use]
	pub fn get_db_config(
		&self,
		logical_name: &str,
		type_default: DbType,
	) -> DbConfig {
		let model = &self.config.user_dbs.model;
		let defaults = model.get("_default");
		let own = model.get(logical_name);

		let pick = |f: fn(&DbModelConfig) -> Option<Vec<String>>| {
			own.and_then(f).or_else(|| defaults.and_then(f))
		};

		let db_type = own
			.and_then(|m| m.db_type.as_deref())
			.or_else(|| defaults.and_then(|m| m.db_type.as_deref()))
			.map_or(type_default, |t| {
				if t == "shared" { DbType::Shared } else { DbType::Private }
			});

		DbConfig {
			name: logical_name.to_string(),
			db_type,
			permissions: pick(|m| m.permissions.clone()),
			admin_roles: pick(|m| m.admin_roles.clone()).unwrap_or_default(),
			member_roles: pick(|m| m.member_roles.clone()).unwrap_or_default(),
			design_docs: pick(|m| m.design_docs.clone()).unwrap_or_default(),
		}
	}

	/// Provision a personal DB for a user and return its physical name
	///
	/// Private DBs get a unique physical name per user and are created on
	/// demand; shared DBs are only initialized the first time they appear.
	///
	/// # Errors
	/// Fails if the server rejects provisioning
	#[instrument(skip(self, user))]
	pub async fn add_user_db(
		&self,
		user: &UserDoc,
		logical_name: &str,
		design_docs: &[String],
		db_type: DbType,
		admin_roles: &[String],
		member_roles: &[String],
	) -> Result<String, Error> {
		let physical_name = match db_type {
			DbType::Private => {
				format!(
					"{}_{}${}",
					self.config.user_dbs.private_prefix, logical_name, user.id
				)
			},
			DbType::Shared => logical_name.to_string(),
		};

		let created = self.server.create_db(&physical_name).await?;

		if created || db_type == DbType::Private {
			let defaults = &self.config.user_dbs.default_security_roles;

			// Keep any member names already authorized on the database
			let mut security = if created {
				SecurityDoc::default()
			} else {
				self.server.get_security(&physical_name).await?
			};

			security.admins.roles =
				merge_roles(&defaults.admins, admin_roles);
			security.members.roles =
				merge_roles(&defaults.members, member_roles);

			self.server.put_security(&physical_name, &security).await?;
		}

		for design_doc in design_docs {
			match self.load_design_doc(design_doc).await? {
				Some(doc) => {
					self.server.put_design_doc(&physical_name, &doc).await?;
				},
				None => {
					warn!(
						"design doc {design_doc} not found for db \
						 {logical_name}"
					);
				},
			}
		}

		debug!("provisioned db {physical_name} for user {}", user.id);

		Ok(physical_name)
	}

	/// Read a design document from the configured design doc directory
	async fn load_design_doc(
		&self,
		name: &str,
	) -> Result<Option<DesignDoc>, Error> {
		let Some(dir) = &self.config.user_dbs.design_doc_dir else {
			return Ok(None);
		};

		let path = dir.join(format!("{name}.json"));

		let bytes = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Ok(None);
			},
			Err(e) => return Err(e.into()),
		};

		Ok(Some(serde_json::from_slice(&bytes)?))
	}

	/// Generate a session credential for a user
	///
	/// Backends with their own API key generator mint the credential; all
	/// others generate it locally. Locally minted keys never start with `_`
	/// or `-`.
	///
	/// # Errors
	/// Fails if the backend's key generator fails
	#[instrument(skip(self, roles))]
	pub async fn generate_session(
		&self,
		user_id: &str,
		provider: &str,
		roles: &[String],
	) -> Result<SessionToken, Error> {
		let (key, password) = match self.server.generate_api_key().await? {
			Some(api_key) => (api_key.key, api_key.password),
			None => (key_uuid(), url_safe_uuid()),
		};

		let issued = Utc::now().timestamp_millis();
		let expires = issued + self.config.security.session_life * 1000;

		Ok(SessionToken {
			user_id: user_id.to_string(),
			key,
			password,
			issued,
			expires,
			provider: provider.to_string(),
			roles: roles.to_vec(),
		})
	}

	/// Write a session credential to the DB auth store
	///
	/// The password is hashed before it leaves the process.
	///
	/// # Errors
	/// Fails if hashing or the write fails
	#[instrument(skip(self, password, roles))]
	pub async fn store_key(
		&self,
		user_id: &str,
		key: &str,
		password: &str,
		expires: i64,
		roles: &[String],
	) -> Result<(), Error> {
		let hashed = hash_password(password)?;

		let record = KeyRecord {
			key:         key.to_string(),
			user_id:     user_id.to_string(),
			salt:        hashed.salt,
			derived_key: hashed.derived_key,
			expires,
			roles:       roles.to_vec(),
		};

		self.server.store_key_record(&record).await
	}

	/// Grant keys membership in every listed personal DB
	///
	/// # Errors
	/// Fails if a security document cannot be updated
	#[instrument(skip(self, personal_dbs))]
	pub async fn authorize_user_sessions(
		&self,
		personal_dbs: &BTreeMap<String, PersonalDb>,
		keys: &[String],
	) -> Result<(), Error> {
		for db_name in personal_dbs.keys() {
			let mut security = self.server.get_security(db_name).await?;

			let mut changed = false;
			for key in keys {
				changed |= security.add_member_name(key);
			}

			if changed {
				self.server.put_security(db_name, &security).await?;
			}
		}

		Ok(())
	}

	/// Revoke key membership across all of a user's personal DBs
	///
	/// # Errors
	/// Fails if a security document cannot be updated
	#[instrument(skip(self, user))]
	pub async fn deauthorize_user(
		&self,
		user: &UserDoc,
		keys: &[String],
	) -> Result<(), Error> {
		for db_name in user.personal_dbs.keys() {
			let mut security = self.server.get_security(db_name).await?;

			if security.remove_member_names(keys) {
				self.server.put_security(db_name, &security).await?;
			}
		}

		Ok(())
	}

	/// Delete credentials from the DB auth store
	///
	/// # Errors
	/// Fails if the delete fails
	pub async fn remove_keys(&self, keys: &[String]) -> Result<(), Error> {
		self.server.remove_key_records(keys).await
	}

	/// Destroy a database
	///
	/// # Errors
	/// Fails if the destroy fails
	pub async fn remove_db(&self, physical_name: &str) -> Result<(), Error> {
		self.server.destroy_db(physical_name).await
	}

	/// Sweep the DB auth store for credentials past their expiry
	///
	/// # Errors
	/// Fails if the scan or delete fails
	#[instrument(skip(self))]
	pub async fn remove_expired_keys(&self) -> Result<usize, Error> {
		let now = Utc::now().timestamp_millis();
		let expired = self.server.expired_key_records(now).await?;

		if expired.is_empty() {
			return Ok(0);
		}

		self.server.remove_key_records(&expired).await?;

		info!("removed {} expired session keys", expired.len());

		Ok(expired.len())
	}
}

fn merge_roles(defaults: &[String], extra: &[String]) -> Vec<String> {
	let mut roles = defaults.to_vec();

	for role in extra {
		if !roles.contains(role) {
			roles.push(role.clone());
		}
	}

	roles
}
