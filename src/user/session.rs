//! Session issuance, refresh, and revocation

use chrono::Utc;
use serde_json::{Map, Value};

use super::UserService;
use crate::error::{Error, LoginError};
use crate::events::AuthEvent;
use crate::models::{
	RequestContext,
	SessionEntry,
	SessionResponse,
	SessionToken,
	SessionUser,
	UserDoc,
};
use crate::util::{get_expired_sessions, get_sessions, session_db_url};

/// Which sessions a [`UserService::logout_user_sessions`] call targets
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogoutOp {
	All,
	Other,
	Expired,
}

impl UserService {
	/// Issue a new session for a user
	///
	/// The token is stored and authorized before it ever appears on the
	/// user document; the document is persisted last.
	///
	/// # Errors
	/// Fails if the user is unknown or a store rejects the session
	#[instrument(skip(self, req))]
	pub async fn create_session(
		&self,
		user_id: &str,
		provider: &str,
		req: &RequestContext,
	) -> Result<SessionResponse, Error> {
		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			let token = self
				.db_auth
				.generate_session(&user.id, provider, &user.roles)
				.await?;

			self.session.store_token(&token).await?;
			self.db_auth
				.store_key(
					&user.id,
					&token.key,
					&token.password,
					token.expires,
					&token.roles,
				)
				.await?;
			self.db_auth
				.authorize_user_sessions(
					&user.personal_dbs,
					std::slice::from_ref(&token.key),
				)
				.await?;

			user.session.insert(token.key.clone(), SessionEntry {
				issued:   token.issued,
				expires:  token.expires,
				provider: provider.to_string(),
				ip:       req.ip.clone(),
			});

			if provider == "local"
				&& let Some(local) = &mut user.local
			{
				local.failed_login_attempts = Some(0);
				local.locked_until = None;
			}

			self.push_activity(&mut user, "login", provider, req);

			self.logout_user_sessions(&mut user, LogoutOp::Expired, None)
				.await?;

			self.store.put(&mut user).await?;

			info!("logged in user {} via {provider}", user.id);

			self.events.emit(AuthEvent::Login {
				user_id:  user.id.clone(),
				provider: provider.to_string(),
			});

			Ok(self.session_response(&user, &token, req))
		})
		.await
	}

	/// Build the payload handed back to a freshly authenticated client
	fn session_response(
		&self,
		user: &UserDoc,
		token: &SessionToken,
		req: &RequestContext,
	) -> SessionResponse {
		let user_dbs = user
			.personal_dbs
			.iter()
			.map(|(physical, entry)| {
				(
					entry.name.clone(),
					session_db_url(
						&self.config.db_server,
						physical,
						&token.key,
						&token.password,
					),
				)
			})
			.collect();

		SessionResponse {
			token:      token.key.clone(),
			password:   token.password.clone(),
			user_id:    user.id.clone(),
			user_email: user.email.clone(),
			user_phone: user.phone.clone(),
			roles:      user.roles.clone(),
			issued:     token.issued,
			expires:    token.expires,
			provider:   token.provider.clone(),
			ip:         req.ip.clone(),
			profile:    self.mapped_profile(user),
			user_dbs,
		}
	}

	/// Synthesize the session profile from provider profiles
	///
	/// Providers are consulted in the configured order; the first one
	/// carrying a mapped field wins.
	fn mapped_profile(&self, user: &UserDoc) -> Option<Value> {
		let mut profile = match &user.profile {
			Some(Value::Object(map)) => map.clone(),
			_ => Map::new(),
		};

		for entry in &self.config.session.profile_mapping {
			for source in &entry.sources {
				let Some(info) = user.provider_info(&source.provider) else {
					continue;
				};

				if let Some(value) = info.profile.get(&source.key) {
					profile.insert(entry.field.clone(), value.clone());

					break;
				}
			}
		}

		if profile.is_empty() {
			return None;
		}

		Some(Value::Object(profile))
	}

	/// Validate a bearer key/password pair
	///
	/// # Errors
	/// Fails unauthorized when the token is unknown, expired, or mismatched
	pub async fn confirm_session(
		&self,
		key: &str,
		password: &str,
	) -> Result<SessionUser, Error> {
		self.session.confirm_token(key, password).await
	}

	/// Record a failed local login and apply the lockout policy
	///
	/// Returns whether the account is now locked.
	///
	/// # Errors
	/// Fails if the user cannot be loaded or persisted
	#[instrument(skip(self, req))]
	pub async fn handle_failed_login(
		&self,
		user_id: &str,
		req: &RequestContext,
	) -> Result<bool, Error> {
		let Some(max_failed) = self.config.security.max_failed_logins else {
			return Ok(false);
		};

		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			let Some(local) = &mut user.local else {
				return Ok(false);
			};

			let attempts = local.failed_login_attempts.unwrap_or(0) + 1;
			local.failed_login_attempts = Some(attempts);

			let locked = attempts > max_failed;
			if locked {
				local.locked_until = Some(
					Utc::now().timestamp_millis()
						+ self.config.security.lockout_time * 1000,
				);
			}

			self.push_activity(&mut user, "failed login", "local", req);

			self.store.put(&mut user).await?;

			warn!(
				"failed login for user {} (attempt {attempts})",
				user.id
			);

			Ok(locked)
		})
		.await
	}

	/// Extend a session's lifetime
	///
	/// # Errors
	/// Fails unauthorized when the token no longer exists
	#[instrument(skip(self))]
	pub async fn refresh_session(
		&self,
		key: &str,
	) -> Result<SessionToken, Error> {
		self.with_retry(async || {
			let Some(mut token) = self.session.fetch_token(key).await? else {
				return Err(LoginError::Unauthorized.into());
			};

			let now = Utc::now().timestamp_millis();
			token.issued = now;
			token.expires = now + self.config.security.session_life * 1000;

			self.session.store_token(&token).await?;

			let mut user = self.load_user(&token.user_id).await?;

			if let Some(entry) = user.session.get_mut(key) {
				entry.expires = token.expires;
			}

			self.logout_user_sessions(&mut user, LogoutOp::Expired, None)
				.await?;

			self.store.put(&mut user).await?;

			debug!("refreshed session {key} for user {}", user.id);

			self.events.emit(AuthEvent::Refresh {
				user_id: user.id.clone(),
				session: key.to_string(),
			});

			Ok(token)
		})
		.await
	}

	/// End every session of a user, addressed by user or session id
	///
	/// # Errors
	/// Fails unauthorized when neither id resolves to a user
	#[instrument(skip(self))]
	pub async fn logout_user(
		&self,
		user_id: Option<&str>,
		session_id: Option<&str>,
	) -> Result<(), Error> {
		self.with_retry(async || {
			let mut user = match (user_id, session_id) {
				(Some(id), _) => self.load_user(id).await?,
				(None, Some(session)) => {
					let mut rows =
						self.store.query_view("session", session).await?;

					if rows.is_empty() {
						return Err(LoginError::Unauthorized.into());
					}

					rows.remove(0)
				},
				(None, None) => {
					return Err(LoginError::Unauthorized.into());
				},
			};

			self.logout_user_sessions(&mut user, LogoutOp::All, None).await?;

			self.store.put(&mut user).await?;

			info!("logged out all sessions of user {}", user.id);

			self.events.emit(AuthEvent::Logout { user_id: user.id.clone() });
			self.events
				.emit(AuthEvent::LogoutAll { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// End a single session
	///
	/// # Errors
	/// Fails if a store rejects the revocation
	#[instrument(skip(self))]
	pub async fn logout_session(&self, session_id: &str) -> Result<(), Error> {
		self.with_retry(async || {
			let keys = vec![session_id.to_string()];

			let mut rows =
				self.store.query_view("session", session_id).await?;

			let Some(mut user) = (!rows.is_empty()).then(|| rows.remove(0))
			else {
				// No owning document; still clear the orphaned credentials
				self.session.delete_tokens(&keys).await?;
				self.db_auth.remove_keys(&keys).await?;

				return Ok(());
			};

			let before = user.session.len();
			user.session.remove(session_id);

			let (_, (), ()) = tokio::try_join!(
				self.session.delete_tokens(&keys),
				self.db_auth.remove_keys(&keys),
				self.db_auth.deauthorize_user(&user, &keys),
			)?;

			self.logout_user_sessions(&mut user, LogoutOp::Expired, None)
				.await?;

			if user.session.len() != before {
				self.store.put(&mut user).await?;
			}

			info!("logged out session {session_id}");

			self.events.emit(AuthEvent::Logout { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// End every session of the owning user except the given one
	///
	/// # Errors
	/// Fails unauthorized when the session resolves to no user
	#[instrument(skip(self))]
	pub async fn logout_others(&self, session_id: &str) -> Result<(), Error> {
		self.with_retry(async || {
			let mut rows =
				self.store.query_view("session", session_id).await?;

			if rows.is_empty() {
				return Err(LoginError::Unauthorized.into());
			}

			let mut user = rows.remove(0);

			let before = user.session.len();

			self.logout_user_sessions(
				&mut user,
				LogoutOp::Other,
				Some(session_id),
			)
			.await?;

			if user.session.len() != before {
				self.store.put(&mut user).await?;
			}

			info!("logged out other sessions of user {}", user.id);

			self.events.emit(AuthEvent::Logout { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// Revoke a selection of a user's sessions across all three stores
	///
	/// Token deletions, DB auth key removals, and per-DB deauthorizations
	/// run in parallel; the user document is only mutated afterwards and
	/// is NOT persisted here.
	pub(crate) async fn logout_user_sessions(
		&self,
		user: &mut UserDoc,
		op: LogoutOp,
		current: Option<&str>,
	) -> Result<(), Error> {
		let now = Utc::now().timestamp_millis();

		let keys: Vec<String> = match op {
			LogoutOp::All => get_sessions(user),
			LogoutOp::Other => {
				get_sessions(user)
					.into_iter()
					.filter(|key| Some(key.as_str()) != current)
					.collect()
			},
			LogoutOp::Expired => get_expired_sessions(user, now),
		};

		if !keys.is_empty() {
			let (_, (), ()) = tokio::try_join!(
				self.session.delete_tokens(&keys),
				self.db_auth.remove_keys(&keys),
				self.db_auth.deauthorize_user(user, &keys),
			)?;
		}

		match op {
			LogoutOp::All => user.session.clear(),
			LogoutOp::Other | LogoutOp::Expired => {
				for key in &keys {
					user.session.remove(key);
				}
			},
		}

		Ok(())
	}
}
