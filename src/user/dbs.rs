//! Personal DB management and account removal

use super::UserService;
use super::session::LogoutOp;
use crate::error::Error;
use crate::events::AuthEvent;
use crate::models::{DbType, PersonalDb, UserDoc};

impl UserService {
	/// Provision every DB listed under `userDBs.defaultDBs`
	pub(crate) async fn provision_default_dbs(
		&self,
		user: &mut UserDoc,
	) -> Result<(), Error> {
		let defaults = self.config.user_dbs.default_dbs.clone();

		for name in &defaults.private {
			self.attach_db(user, name, DbType::Private, None).await?;
		}

		for name in &defaults.shared {
			self.attach_db(user, name, DbType::Shared, None).await?;
		}

		Ok(())
	}

	/// Provision one DB and record it on the (unsaved) user document
	///
	/// Design docs are stripped from the recorded entry; permissions are
	/// only persisted when explicitly supplied, otherwise they resolve
	/// from config on every session.
	async fn attach_db(
		&self,
		user: &mut UserDoc,
		logical_name: &str,
		type_default: DbType,
		permissions: Option<Vec<String>>,
	) -> Result<String, Error> {
		let db_config =
			self.db_auth.get_db_config(logical_name, type_default);

		let final_name = self
			.db_auth
			.add_user_db(
				user,
				logical_name,
				&db_config.design_docs,
				db_config.db_type,
				&db_config.admin_roles,
				&db_config.member_roles,
			)
			.await?;

		user.personal_dbs.insert(final_name.clone(), PersonalDb {
			name:         logical_name.to_string(),
			db_type:      db_config.db_type,
			permissions,
			admin_roles:  (!db_config.admin_roles.is_empty())
				.then(|| db_config.admin_roles.clone()),
			member_roles: (!db_config.member_roles.is_empty())
				.then(|| db_config.member_roles.clone()),
		});

		Ok(final_name)
	}

	/// Provision an additional personal DB for an existing user
	///
	/// # Errors
	/// Fails if the user is unknown or provisioning fails
	#[instrument(skip(self, permissions))]
	pub async fn add_user_db(
		&self,
		user_id: &str,
		logical_name: &str,
		db_type: Option<DbType>,
		permissions: Option<Vec<String>>,
	) -> Result<String, Error> {
		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			let final_name = self
				.attach_db(
					&mut user,
					logical_name,
					db_type.unwrap_or_default(),
					permissions.clone(),
				)
				.await?;

			self.store.put(&mut user).await?;

			info!("added db {final_name} to user {user_id}");

			self.events.emit(AuthEvent::UserDbAdded {
				user_id: user.id.clone(),
				db_name: logical_name.to_string(),
			});

			Ok(final_name)
		})
		.await
	}

	/// Detach a personal DB, optionally destroying the database itself
	///
	/// `delete_private`/`delete_shared` gate destruction per DB type.
	///
	/// # Errors
	/// Fails if the user is unknown or the destroy fails
	#[instrument(skip(self))]
	pub async fn remove_user_db(
		&self,
		user_id: &str,
		logical_name: &str,
		delete_private: bool,
		delete_shared: bool,
	) -> Result<(), Error> {
		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			let matched: Vec<(String, DbType)> = user
				.personal_dbs
				.iter()
				.filter(|(_, entry)| entry.name == logical_name)
				.map(|(physical, entry)| (physical.clone(), entry.db_type))
				.collect();

			if matched.is_empty() {
				return Ok(());
			}

			for (physical, db_type) in &matched {
				user.personal_dbs.remove(physical);

				let destroy = match db_type {
					DbType::Private => delete_private,
					DbType::Shared => delete_shared,
				};

				if destroy {
					self.db_auth.remove_db(physical).await?;
				}
			}

			self.store.put(&mut user).await?;

			info!("removed db {logical_name} from user {user_id}");

			self.events.emit(AuthEvent::UserDbRemoved {
				user_id: user.id.clone(),
				db_name: logical_name.to_string(),
			});

			Ok(())
		})
		.await
	}

	/// Delete an account: end all sessions, optionally destroy private
	/// DBs, then remove the user document
	///
	/// # Errors
	/// Fails if the user is unknown or a store rejects the removal
	#[instrument(skip(self))]
	pub async fn remove(
		&self,
		user_id: &str,
		destroy_dbs: bool,
	) -> Result<(), Error> {
		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			self.logout_user_sessions(&mut user, LogoutOp::All, None).await?;

			if destroy_dbs {
				for (physical, entry) in &user.personal_dbs {
					if entry.db_type == DbType::Private {
						self.db_auth.remove_db(physical).await?;
					}
				}
			}

			let rev = user.rev.clone().unwrap_or_default();
			self.store.remove(&user.id, &rev).await?;

			info!("removed user {user_id}");

			Ok(())
		})
		.await
	}
}
