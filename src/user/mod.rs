//! The user service: account lifecycle orchestration
//!
//! Owns user documents and coordinates the session store, the DB auth
//! layer, the validation engine, the mailer, and the event bus.

mod dbs;
mod password;
mod session;

use std::sync::Arc;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::config::{Config, UsernameKey};
use crate::dbauth::DbAuth;
use crate::error::{
	AccountError,
	ConflictError,
	Error,
	NotFoundError,
};
use crate::events::{AuthEvent, EventBus};
use crate::mailer::Mailer;
use crate::models::{
	ActivityEntry,
	ProviderInfo,
	RequestContext,
	SignUpInfo,
	UnverifiedEmail,
	UserDoc,
};
use crate::session::SessionStore;
use crate::store::UserStore;
use crate::util::{add_provider_views, auth_design_doc, hash_password, url_safe_uuid};
use crate::validate::{CustomValidator, Rule, Sanitizer, Schema};

static USERNAME_REGEX: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

static DEFAULT_PHONE_REGEX: LazyLock<Regex> =
	LazyLock::new(|| Regex::new(r"^\+?[\d][\d\s().-]{5,}$").unwrap());

const MAX_WRITE_RETRIES: usize = 3;

/// A user-supplied transformation run during `onCreate`/`onLink`
///
/// Transformations must return the updated document; the pipeline folds
/// over them sequentially, awaiting each result before running the next.
pub type Transform = Box<
	dyn Fn(UserDoc, String) -> BoxFuture<'static, Result<UserDoc, Error>>
		+ Send
		+ Sync,
>;

/// Owns user documents and orchestrates every account operation
pub struct UserService {
	pub(crate) config:  Arc<Config>,
	pub(crate) store:   Arc<dyn UserStore>,
	pub(crate) session: Arc<dyn SessionStore>,
	pub(crate) db_auth: DbAuth,
	pub(crate) mailer:  Mailer,
	pub(crate) events:  EventBus,
	on_create:          Vec<Transform>,
	on_link:            Vec<Transform>,
	phone_regex:        Regex,
}

impl UserService {
	/// Wire up a new user service
	///
	/// # Panics
	/// Panics if `local.phoneRegexp` is not a valid regular expression
	#[must_use]
	pub fn new(
		config: Arc<Config>,
		store: Arc<dyn UserStore>,
		session: Arc<dyn SessionStore>,
		db_auth: DbAuth,
		mailer: Mailer,
		events: EventBus,
	) -> Self {
		let phone_regex = config
			.local
			.phone_regexp
			.as_deref()
			.map_or_else(
				|| DEFAULT_PHONE_REGEX.clone(),
				|pattern| {
					Regex::new(pattern).expect("invalid phone regexp")
				},
			);

		Self {
			config,
			store,
			session,
			db_auth,
			mailer,
			events,
			on_create: Vec::new(),
			on_link: Vec::new(),
			phone_regex,
		}
	}

	/// Seed the auth design document, including provider-indexed views
	///
	/// # Errors
	/// Fails if the store rejects the design document
	pub async fn initialize(&self) -> Result<(), Error> {
		let mut doc = auth_design_doc();

		let providers: Vec<String> =
			self.config.providers.keys().cloned().collect();
		add_provider_views(&mut doc, &providers);

		self.store.ensure_design_doc(&doc).await
	}

	/// Register an `onCreate` transformation
	pub fn add_on_create(&mut self, transform: Transform) {
		self.on_create.push(transform);
	}

	/// Register an `onLink` transformation
	pub fn add_on_link(&mut self, transform: Transform) {
		self.on_link.push(transform);
	}

	/// Subscribe to lifecycle events
	#[must_use]
	pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AuthEvent> {
		self.events.subscribe()
	}

	/// Run a write operation, retrying on stale document revisions
	///
	/// The whole logical operation re-runs (including its re-read) so the
	/// retry always works on fresh state.
	pub(crate) async fn with_retry<T>(
		&self,
		mut op: impl AsyncFnMut() -> Result<T, Error>,
	) -> Result<T, Error> {
		let mut attempt = 0;

		loop {
			match op().await {
				Err(Error::RevisionConflict) if attempt < MAX_WRITE_RETRIES => {
					attempt += 1;
					debug!("revision conflict, retrying (attempt {attempt})");
				},
				other => return other,
			}
		}
	}

	/// Detect which identity field a login value belongs to
	#[must_use]
	pub fn login_type(&self, login: &str) -> UsernameKey {
		for key in &self.config.local.username_keys {
			match key {
				UsernameKey::Email if login.validate_email() => {
					return UsernameKey::Email;
				},
				UsernameKey::Phone if self.phone_regex.is_match(login) => {
					return UsernameKey::Phone;
				},
				_ => {},
			}
		}

		UsernameKey::Username
	}

	/// The lookup view backing a given login key
	fn view_for(&self, key: UsernameKey) -> &'static str {
		if self.config.local.email_username
			&& matches!(key, UsernameKey::Email | UsernameKey::Username)
		{
			return "emailUsername";
		}

		key.field()
	}

	/// Find a user by any enabled login key
	///
	/// # Errors
	/// Fails if the store query fails
	#[instrument(skip(self))]
	pub async fn get(&self, login: &str) -> Result<Option<UserDoc>, Error> {
		// Stored identity fields are sanitized, so lookups are too
		let login = login.trim().to_lowercase();

		let view = self.view_for(self.login_type(&login));
		let mut rows = self.store.query_view(view, &login).await?;

		Ok(if rows.is_empty() { None } else { Some(rows.remove(0)) })
	}

	/// Load a user document by `_id`, failing when absent
	pub(crate) async fn load_user(&self, user_id: &str) -> Result<UserDoc, Error> {
		self.store
			.get(user_id)
			.await?
			.ok_or_else(|| NotFoundError::Username.into())
	}

	/// The base user model, before the `userModel` config extension
	fn base_user_model(&self) -> Schema {
		let local = &self.config.local;

		let mut schema = Schema {
			whitelist: vec![
				local.username_field.clone(),
				local.password_field.clone(),
				"confirmPassword".to_string(),
				"inviteCode".to_string(),
			],
			..Schema::default()
		};

		for key in &local.username_keys {
			let field = key.field().to_string();

			if !schema.whitelist.contains(&field) {
				schema.whitelist.push(field);
			}
		}

		schema.sanitize.insert(
			local.username_field.clone(),
			vec![Sanitizer::Trim, Sanitizer::ToLowerCase],
		);
		schema
			.sanitize
			.insert("email".to_string(), vec![Sanitizer::Trim, Sanitizer::ToLowerCase]);

		schema.validate.insert(
			local.password_field.clone(),
			vec![Rule::Presence, Rule::Matches("confirmPassword".to_string())],
		);
		schema
			.validate
			.insert("confirmPassword".to_string(), vec![Rule::Presence]);
		schema.validate.insert(
			"email".to_string(),
			vec![Rule::Custom("validateEmail".to_string())],
		);
		schema.validate.insert(
			"phone".to_string(),
			vec![Rule::Custom("validatePhone".to_string())],
		);
		schema.validate.insert(
			"username".to_string(),
			vec![Rule::Custom("validateUsername".to_string())],
		);

		schema
	}

	/// Register a new local account
	///
	/// # Errors
	/// Fails on validation errors, a missing invite code, or store errors
	#[instrument(skip(self, form, req))]
	pub async fn create(
		&self,
		form: &Map<String, Value>,
		req: &RequestContext,
	) -> Result<UserDoc, Error> {
		let local = &self.config.local;

		let login = form
			.get(&local.username_field)
			.and_then(Value::as_str)
			.unwrap_or_default()
			.trim()
			.to_lowercase();

		// Duplicate the login into its detected field so a single form
		// field serves every enabled key type; the carrier field is
		// dropped once it has served its purpose
		let detected = self.login_type(&login);

		let mut form = form.clone();
		if !login.is_empty() {
			form.insert(
				detected.field().to_string(),
				Value::String(login.clone()),
			);
		}
		if detected.field() != local.username_field {
			form.remove(&local.username_field);
		}

		let mut schema = self.base_user_model();
		if let Some(extension) = &self.config.user_model {
			schema = Schema::merge(&schema, extension);
		}
		schema
			.validate
			.entry(detected.field().to_string())
			.or_default()
			.push(Rule::Presence);

		let mut doc_map = schema.process(&form, self).await?;

		// The invite key is only consumed once validation has passed
		let mut invite_id = None;
		if self.config.security.invite_only_registration {
			let code = doc_map
				.get("inviteCode")
				.and_then(Value::as_str)
				.unwrap_or_default()
				.to_string();

			let name = format!("invite_code:{code}");

			let Some(value) = self.session.get_key(&name).await? else {
				return Err(Error::MissingInviteCode);
			};

			self.session.delete_keys(&[name]).await?;

			if value.len() == 32 {
				invite_id = Some(value);
			}
		}

		doc_map.remove("inviteCode");

		let password = doc_map
			.remove(&local.password_field)
			.and_then(|v| v.as_str().map(ToString::to_string))
			.unwrap_or_default();
		doc_map.remove("confirmPassword");

		if !doc_map.contains_key("_id") {
			let id = match invite_id {
				Some(id) => id,
				None if local.uuid_as_id => {
					Uuid::new_v4().simple().to_string()
				},
				None => login.clone(),
			};

			doc_map.insert("_id".to_string(), Value::String(id));
		}

		let mut user: UserDoc =
			serde_json::from_value(Value::Object(doc_map))?;

		if local.send_confirm_email
			&& let Some(email) = user.email.take()
		{
			user.unverified_email =
				Some(UnverifiedEmail { email, token: url_safe_uuid() });
		}

		let hashed = hash_password(&password)?;
		user.local = Some(crate::models::LocalAuth {
			salt:                  hashed.salt,
			derived_key:           hashed.derived_key,
			failed_login_attempts: None,
			locked_until:          None,
		});

		user.providers = vec!["local".to_string()];
		user.roles = self.config.security.default_roles.clone();
		user.sign_up = Some(SignUpInfo {
			provider:  "local".to_string(),
			timestamp: Utc::now(),
			ip:        req.ip.clone(),
		});
		user.extra.insert(
			self.config.db_server.type_field.clone(),
			Value::String("user".to_string()),
		);

		self.provision_default_dbs(&mut user).await?;
		self.push_activity(&mut user, "signup", "local", req);

		let mut user = self.run_transforms(&self.on_create, user, "local").await?;

		self.store.put(&mut user).await?;

		if let Some(unverified) = &user.unverified_email {
			self.mailer
				.send(
					"confirmEmail",
					&unverified.email,
					&[("token", unverified.token.as_str())],
				)
				.await?;
		}

		info!("created new user {}", user.id);

		self.events.emit(AuthEvent::Signup {
			user_id:  user.id.clone(),
			provider: "local".to_string(),
		});

		Ok(user)
	}

	/// Log in or register a user with normalized federated credentials
	///
	/// # Errors
	/// Fails on conflicts, a missing invite code, or store errors
	#[instrument(skip(self, auth, profile, req))]
	pub async fn social_auth(
		&self,
		provider: &str,
		auth: Value,
		profile: Value,
		req: &RequestContext,
	) -> Result<UserDoc, Error> {
		let profile_id = profile_id_of(&profile);

		let mut rows = self.store.query_view(provider, &profile_id).await?;

		if !rows.is_empty() {
			let mut user = rows.remove(0);

			let mut profile = profile;
			strip_raw(&mut profile);
			user.set_provider_info(provider, &ProviderInfo {
				auth,
				profile,
			});

			self.push_activity(&mut user, "login", provider, req);

			let mut user =
				self.run_transforms(&self.on_link, user, provider).await?;

			self.store.put(&mut user).await?;

			return Ok(user);
		}

		if self.config.security.invite_only_registration {
			let code = req.invite_code.clone().unwrap_or_default();
			let name = format!("invite_code:{code}");

			if self.session.get_key(&name).await?.is_none() {
				return Err(Error::MissingInviteCode);
			}

			self.session.delete_keys(&[name]).await?;
		}

		let email = primary_email(&profile);

		if let Some(email) = &email
			&& !self.store.query_view("email", email).await?.is_empty()
		{
			return Err(ConflictError::EmailInUseLink.into());
		}

		let base_username = base_username_of(&profile, &profile_id);

		let id = if self.config.local.uuid_as_id {
			Uuid::new_v4().simple().to_string()
		} else {
			self.generate_username(&base_username).await?
		};

		let mut profile = profile;
		strip_raw(&mut profile);

		let mut user = UserDoc {
			id,
			email,
			providers: vec![provider.to_string()],
			roles: self.config.security.default_roles.clone(),
			sign_up: Some(SignUpInfo {
				provider:  provider.to_string(),
				timestamp: Utc::now(),
				ip:        req.ip.clone(),
			}),
			..UserDoc::default()
		};
		user.set_provider_info(provider, &ProviderInfo { auth, profile });
		user.extra.insert(
			self.config.db_server.type_field.clone(),
			Value::String("user".to_string()),
		);

		self.provision_default_dbs(&mut user).await?;
		self.push_activity(&mut user, "signup", provider, req);

		let mut user =
			self.run_transforms(&self.on_create, user, provider).await?;

		self.store.put(&mut user).await?;

		info!("created new user {} via {provider}", user.id);

		self.events.emit(AuthEvent::Signup {
			user_id:  user.id.clone(),
			provider: provider.to_string(),
		});

		Ok(user)
	}

	/// Attach a federated identity to an existing account
	///
	/// # Errors
	/// Fails when the identity or its email is claimed elsewhere
	#[instrument(skip(self, auth, profile, req))]
	pub async fn link_social(
		&self,
		user_id: &str,
		provider: &str,
		auth: Value,
		profile: Value,
		req: &RequestContext,
	) -> Result<UserDoc, Error> {
		self.with_retry(async || {
			let profile_id = profile_id_of(&profile);

			let rows = self.store.query_view(provider, &profile_id).await?;
			if rows.iter().any(|row| row.id != user_id) {
				return Err(
					ConflictError::ProviderInUse(provider.to_string()).into()
				);
			}

			let mut user = self.load_user(user_id).await?;

			if let Some(existing) = user.provider_info(provider)
				&& profile_id_of(&existing.profile) != profile_id
			{
				return Err(ConflictError::ProviderConflict(
					provider.to_string(),
				)
				.into());
			}

			if let Some(email) = primary_email(&profile) {
				let rows = self.store.query_view("email", &email).await?;

				if rows.iter().any(|row| row.id != user_id) {
					return Err(ConflictError::EmailInUse.into());
				}
			}

			let mut profile = profile.clone();
			strip_raw(&mut profile);
			user.set_provider_info(provider, &ProviderInfo {
				auth:    auth.clone(),
				profile,
			});

			if !user.providers.iter().any(|p| p == provider) {
				user.providers.push(provider.to_string());
			}

			self.push_activity(&mut user, "link", provider, req);

			let mut user = self
				.run_transforms(&self.on_link, user, provider)
				.await?;

			self.store.put(&mut user).await?;

			Ok(user)
		})
		.await
	}

	/// Detach a federated identity from an account
	///
	/// # Errors
	/// Fails when unlinking would strand the account
	#[instrument(skip(self))]
	pub async fn unlink(
		&self,
		user_id: &str,
		provider: &str,
	) -> Result<UserDoc, Error> {
		self.with_retry(async || {
			if provider.is_empty() {
				return Err(AccountError::MissingProviderToUnlink.into());
			}

			if provider == "local" {
				return Err(AccountError::UnlinkLocal.into());
			}

			let mut user = self.load_user(user_id).await?;

			if user.providers.len() < 2 {
				return Err(AccountError::UnlinkOnlyProvider.into());
			}

			if !user.providers.iter().any(|p| p == provider) {
				return Err(NotFoundError::Provider.into());
			}

			user.remove_provider_info(provider);
			user.providers.retain(|p| p != provider);

			self.store.put(&mut user).await?;

			info!("unlinked {provider} from user {user_id}");

			Ok(user)
		})
		.await
	}

	/// Find a free `_id` by suffixing the base username
	///
	/// Scans the lexicographic id range `[base, base + U+FFFF)`; existing
	/// data depends on these exact bounds.
	async fn generate_username(&self, base: &str) -> Result<String, Error> {
		let end = format!("{base}\u{ffff}");
		let taken = self.store.id_range(base, &end).await?;

		if !taken.iter().any(|id| id == base) {
			return Ok(base.to_string());
		}

		let taken: std::collections::HashSet<&str> =
			taken.iter().map(String::as_str).collect();

		let mut suffix = 1u64;
		loop {
			let candidate = format!("{base}{suffix}");

			if !taken.contains(candidate.as_str()) {
				return Ok(candidate);
			}

			suffix += 1;
		}
	}

	/// Sequentially fold the registered transformations over a document
	async fn run_transforms(
		&self,
		transforms: &[Transform],
		user: UserDoc,
		provider: &str,
	) -> Result<UserDoc, Error> {
		let mut user = user;

		for transform in transforms {
			user = transform(user, provider.to_string()).await?;
		}

		Ok(user)
	}

	/// Prepend an activity entry, trimming the log to its configured size
	pub(crate) fn push_activity(
		&self,
		user: &mut UserDoc,
		action: &str,
		provider: &str,
		req: &RequestContext,
	) {
		let size = self.config.security.user_activity_log_size;

		if size == 0 {
			return;
		}

		user.activity.insert(0, ActivityEntry {
			timestamp: Utc::now(),
			action:    action.to_string(),
			provider:  provider.to_string(),
			ip:        req.ip.clone(),
		});
		user.activity.truncate(size);
	}

	/// Fetch (or reuse) a user document and record an activity entry
	///
	/// # Errors
	/// Fails if the user cannot be loaded or persisted
	pub async fn log_activity(
		&self,
		user_id: &str,
		action: &str,
		provider: &str,
		req: &RequestContext,
		user: Option<&mut UserDoc>,
	) -> Result<(), Error> {
		match user {
			Some(user) => {
				self.push_activity(user, action, provider, req);

				Ok(())
			},
			None => {
				self.with_retry(async || {
					let mut user = self.load_user(user_id).await?;
					self.push_activity(&mut user, action, provider, req);

					self.store.put(&mut user).await
				})
				.await
			},
		}
	}
}

#[async_trait]
impl CustomValidator for UserService {
	async fn validate(
		&self,
		name: &str,
		value: &str,
	) -> Result<Option<String>, Error> {
		match name {
			"validateEmail" => {
				if !value.validate_email() {
					return Ok(Some("is not a valid email".to_string()));
				}

				let rows = self.store.query_view("email", value).await?;

				Ok((!rows.is_empty()).then(|| "already in use".to_string()))
			},
			"validatePhone" => {
				if !self.phone_regex.is_match(value) {
					return Ok(Some(
						"is not a valid phone number".to_string(),
					));
				}

				let rows = self.store.query_view("phone", value).await?;

				Ok((!rows.is_empty()).then(|| "already in use".to_string()))
			},
			"validateUsername" => {
				if !USERNAME_REGEX.is_match(value) {
					return Ok(Some(
						"may only contain letters, numbers, dashes, and \
						 underscores"
							.to_string(),
					));
				}

				let rows = self.store.query_view("username", value).await?;

				Ok((!rows.is_empty()).then(|| "already in use".to_string()))
			},
			other => {
				warn!("unknown custom validator '{other}'");

				Ok(None)
			},
		}
	}
}

/// A provider profile id, normalized to a string
fn profile_id_of(profile: &Value) -> String {
	match profile.get("id") {
		Some(Value::String(id)) => id.clone(),
		Some(other) => other.to_string(),
		None => String::new(),
	}
}

/// The first email address listed on a provider profile
fn primary_email(profile: &Value) -> Option<String> {
	profile
		.get("emails")
		.and_then(Value::as_array)
		.and_then(|emails| emails.first())
		.and_then(|email| email.get("value"))
		.and_then(Value::as_str)
		.map(str::to_lowercase)
}

/// Derive a base username from a provider profile
fn base_username_of(profile: &Value, profile_id: &str) -> String {
	if let Some(username) = profile.get("username").and_then(Value::as_str)
		&& !username.is_empty()
	{
		return username.to_lowercase();
	}

	if let Some(email) = primary_email(profile)
		&& let Some(local_part) = email.split('@').next()
		&& !local_part.is_empty()
	{
		return local_part.to_string();
	}

	if let Some(display) = profile.get("displayName").and_then(Value::as_str)
		&& !display.is_empty()
	{
		return display.replace(' ', "").to_lowercase();
	}

	profile_id.to_lowercase()
}

/// Drop the raw provider payload before it reaches the document store
fn strip_raw(profile: &mut Value) {
	if let Value::Object(map) = profile {
		map.remove("_raw");
	}
}
