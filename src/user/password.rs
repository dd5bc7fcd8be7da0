//! Password flows and login-credential changes

use chrono::Utc;
use serde_json::{Map, Value};
use validator::ValidateEmail;

use super::UserService;
use crate::config::UsernameKey;
use crate::error::{
	AccountError,
	Error,
	NotFoundError,
	PasswordChangeError,
	TokenError,
	ValidationErrors,
};
use crate::events::AuthEvent;
use crate::models::{
	ForgotPassword,
	LocalAuth,
	RequestContext,
	UnverifiedEmail,
	UserDoc,
};
use crate::user::session::LogoutOp;
use crate::util::{hash_password, hash_token, url_safe_uuid, verify_password};
use crate::validate::{Rule, Schema};

fn field_error(field: &str, message: &str) -> Error {
	let mut errors = ValidationErrors::new();
	errors.insert(field.to_string(), vec![message.to_string()]);

	Error::Validation(errors)
}

fn presence_schema(fields: &[&str], matched: Option<(&str, &str)>) -> Schema {
	let mut schema = Schema {
		whitelist: fields.iter().map(ToString::to_string).collect(),
		..Schema::default()
	};

	for field in fields {
		schema
			.validate
			.insert((*field).to_string(), vec![Rule::Presence]);
	}

	if let Some((field, other)) = matched {
		schema
			.validate
			.entry(field.to_string())
			.or_default()
			.push(Rule::Matches(other.to_string()));
	}

	schema
}

impl UserService {
	/// Start a password reset: store the hashed token, email the plaintext
	///
	/// # Errors
	/// Fails when no user owns the email address
	#[instrument(skip(self, req))]
	pub async fn forgot_password(
		&self,
		email: &str,
		req: &RequestContext,
	) -> Result<(), Error> {
		self.with_retry(async || {
			let mut rows = self.store.query_view("email", email).await?;

			if rows.is_empty() {
				return Err(NotFoundError::Username.into());
			}

			let mut user = rows.remove(0);

			let token = url_safe_uuid();
			let now = Utc::now().timestamp_millis();

			user.forgot_password = Some(ForgotPassword {
				token:   hash_token(&token),
				issued:  now,
				expires: now + self.config.security.token_life * 1000,
			});

			self.push_activity(&mut user, "forgot password", "local", req);

			self.store.put(&mut user).await?;

			self.mailer
				.send("forgotPassword", email, &[("token", token.as_str())])
				.await?;

			info!("issued password reset token for user {}", user.id);

			self.events
				.emit(AuthEvent::ForgotPassword { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// Complete a password reset with an emailed token
	///
	/// Invalidates every session of the user before the reset record is
	/// removed.
	///
	/// # Errors
	/// Fails on validation errors or an invalid/expired token
	#[instrument(skip(self, form, req))]
	pub async fn reset_password(
		&self,
		form: &Map<String, Value>,
		req: &RequestContext,
	) -> Result<UserDoc, Error> {
		let schema = presence_schema(
			&["token", "password", "confirmPassword"],
			Some(("password", "confirmPassword")),
		);
		let form = schema.process(form, self).await?;

		let token =
			form.get("token").and_then(Value::as_str).unwrap_or_default();
		let password =
			form.get("password").and_then(Value::as_str).unwrap_or_default();

		self.with_retry(async || {
			let mut rows = self
				.store
				.query_view("passwordReset", &hash_token(token))
				.await?;

			if rows.is_empty() {
				return Err(TokenError::Invalid.into());
			}

			let mut user = rows.remove(0);

			let expired = user
				.forgot_password
				.as_ref()
				.is_none_or(|f| f.expires < Utc::now().timestamp_millis());

			if expired {
				return Err(TokenError::Expired.into());
			}

			let hashed = hash_password(password)?;
			user.local = Some(LocalAuth {
				salt:                  hashed.salt,
				derived_key:           hashed.derived_key,
				failed_login_attempts: None,
				locked_until:          None,
			});

			if !user.providers.iter().any(|p| p == "local") {
				user.providers.push("local".to_string());
			}

			self.logout_user_sessions(&mut user, LogoutOp::All, None).await?;

			user.forgot_password = None;

			self.push_activity(&mut user, "reset password", "local", req);

			self.store.put(&mut user).await?;

			info!("reset password for user {}", user.id);

			self.events
				.emit(AuthEvent::PasswordReset { user_id: user.id.clone() });

			Ok(user)
		})
		.await
	}

	/// Reset a password for a known username
	///
	/// Used when the reset token has already been verified elsewhere.
	///
	/// # Errors
	/// Fails on validation errors or an unknown username
	#[instrument(skip(self, form, req))]
	pub async fn reset_password_by_username(
		&self,
		form: &Map<String, Value>,
		req: &RequestContext,
	) -> Result<(), Error> {
		let schema = presence_schema(
			&["username", "password", "confirmPassword"],
			Some(("password", "confirmPassword")),
		);
		let form = schema.process(form, self).await?;

		let username =
			form.get("username").and_then(Value::as_str).unwrap_or_default();
		let password =
			form.get("password").and_then(Value::as_str).unwrap_or_default();

		let Some(user) = self.get(username).await? else {
			return Err(NotFoundError::Username.into());
		};

		self.change_password(&user.id.clone(), password, Some(user), req)
			.await
	}

	/// Change a password after checking the current one
	///
	/// Accounts without local credentials (social-only) may set a password
	/// without supplying a current one. When the request carries a session
	/// key, every other session is logged out afterwards.
	///
	/// # Errors
	/// Fails on validation errors or a wrong current password
	#[instrument(skip(self, form, req))]
	pub async fn change_password_secure(
		&self,
		user_id: &str,
		form: &Map<String, Value>,
		req: &RequestContext,
	) -> Result<(), Error> {
		// currentPassword is only required when a password already exists,
		// so it is whitelisted but not validated here
		let mut schema = presence_schema(
			&["newPassword", "confirmPassword"],
			Some(("newPassword", "confirmPassword")),
		);
		schema.whitelist.push("currentPassword".to_string());

		let form = schema.process(form, self).await?;

		let new_password = form
			.get("newPassword")
			.and_then(Value::as_str)
			.unwrap_or_default();

		let user = self.load_user(user_id).await?;

		if let Some(local) = &user.local {
			let current = form
				.get("currentPassword")
				.and_then(Value::as_str)
				.unwrap_or_default();

			if current.is_empty() {
				return Err(
					PasswordChangeError::MissingCurrentPassword.into()
				);
			}

			match verify_password(&local.derived_key, current) {
				Ok(()) => {},
				Err(Error::Login(_)) => {
					return Err(
						PasswordChangeError::InvalidCurrentPassword.into()
					);
				},
				Err(e) => return Err(e),
			}
		}

		self.change_password(user_id, new_password, Some(user), req).await?;

		if let Some(key) = &req.session_key {
			self.logout_others(key).await?;
		}

		Ok(())
	}

	/// Overwrite a user's local credentials
	///
	/// # Errors
	/// Fails if hashing or persisting fails
	#[instrument(skip(self, new_password, user, req))]
	pub async fn change_password(
		&self,
		user_id: &str,
		new_password: &str,
		user: Option<UserDoc>,
		req: &RequestContext,
	) -> Result<(), Error> {
		let mut provided = user;

		self.with_retry(async || {
			let mut user = match provided.take() {
				Some(user) => user,
				None => self.load_user(user_id).await?,
			};

			let hashed = hash_password(new_password)?;

			match &mut user.local {
				Some(local) => {
					local.salt = hashed.salt;
					local.derived_key = hashed.derived_key;
				},
				None => {
					user.local = Some(LocalAuth {
						salt:                  hashed.salt,
						derived_key:           hashed.derived_key,
						failed_login_attempts: None,
						locked_until:          None,
					});
				},
			}

			if !user.providers.iter().any(|p| p == "local") {
				user.providers.push("local".to_string());
			}

			self.push_activity(&mut user, "changed password", "local", req);

			self.store.put(&mut user).await?;

			info!("changed password for user {}", user.id);

			self.events
				.emit(AuthEvent::PasswordChange { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// Confirm an email address with its emailed token
	///
	/// # Errors
	/// Fails when the token matches no pending confirmation
	#[instrument(skip(self, req))]
	pub async fn verify_email(
		&self,
		token: &str,
		req: &RequestContext,
	) -> Result<UserDoc, Error> {
		self.with_retry(async || {
			let mut rows =
				self.store.query_view("verifyEmail", token).await?;

			if rows.is_empty() {
				return Err(TokenError::InvalidEmailVerification.into());
			}

			let mut user = rows.remove(0);

			if let Some(unverified) = user.unverified_email.take() {
				user.email = Some(unverified.email);
			}

			self.push_activity(&mut user, "verified email", "local", req);

			self.store.put(&mut user).await?;

			info!("verified email for user {}", user.id);

			self.events
				.emit(AuthEvent::EmailVerified { user_id: user.id.clone() });

			Ok(user)
		})
		.await
	}

	/// Whether a field is the user's only populated login credential
	fn sole_login_credential(&self, user: &UserDoc, field: UsernameKey) -> bool {
		let populated = |key: UsernameKey| {
			match key {
				UsernameKey::Username => user.username.is_some(),
				UsernameKey::Email => {
					user.email.is_some() || user.unverified_email.is_some()
				},
				UsernameKey::Phone => user.phone.is_some(),
			}
		};

		if !populated(field) {
			return false;
		}

		!self
			.config
			.local
			.username_keys
			.iter()
			.any(|key| *key != field && populated(*key))
	}

	/// Change or clear a user's email address
	///
	/// With email confirmation enabled the new address is parked in
	/// `unverifiedEmail` until its token comes back.
	///
	/// # Errors
	/// Fails on validation errors or account constraints
	#[instrument(skip(self, req))]
	pub async fn change_email(
		&self,
		user_id: &str,
		new_email: &str,
		req: &RequestContext,
	) -> Result<(), Error> {
		let new_email = new_email.trim().to_lowercase();

		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			if user.local.is_none() {
				return Err(AccountError::PasswordNotSet.into());
			}

			if new_email.is_empty() {
				if self.sole_login_credential(&user, UsernameKey::Email) {
					return Err(AccountError::OnlyLoginCredential.into());
				}

				user.email = None;
				user.unverified_email = None;
			} else {
				if !new_email.validate_email() {
					return Err(field_error("email", "is not a valid email"));
				}

				let rows =
					self.store.query_view("email", &new_email).await?;
				if rows.iter().any(|row| row.id != user_id) {
					return Err(field_error("email", "already in use"));
				}

				if self.config.local.send_confirm_email {
					let token = url_safe_uuid();

					user.unverified_email = Some(UnverifiedEmail {
						email: new_email.clone(),
						token: token.clone(),
					});

					let template = if self
						.config
						.emails
						.contains_key("confirmEmailChange")
					{
						"confirmEmailChange"
					} else {
						"confirmEmail"
					};

					self.mailer
						.send(
							template,
							&new_email,
							&[("token", token.as_str())],
						)
						.await?;
				} else {
					user.email = Some(new_email.clone());
				}
			}

			self.push_activity(&mut user, "changed email", "local", req);

			self.store.put(&mut user).await?;

			info!("changed email for user {}", user.id);

			self.events
				.emit(AuthEvent::EmailChanged { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}

	/// Change or clear a user's phone number
	///
	/// # Errors
	/// Fails on validation errors or account constraints
	#[instrument(skip(self, req))]
	pub async fn change_phone(
		&self,
		user_id: &str,
		new_phone: &str,
		req: &RequestContext,
	) -> Result<(), Error> {
		let new_phone = new_phone.trim().to_string();

		self.with_retry(async || {
			let mut user = self.load_user(user_id).await?;

			if user.local.is_none() {
				return Err(AccountError::PasswordNotSet.into());
			}

			if new_phone.is_empty() {
				if self.sole_login_credential(&user, UsernameKey::Phone) {
					return Err(AccountError::OnlyLoginCredential.into());
				}

				user.phone = None;
			} else {
				if !self.phone_regex.is_match(&new_phone) {
					return Err(field_error(
						"phone",
						"is not a valid phone number",
					));
				}

				let rows =
					self.store.query_view("phone", &new_phone).await?;
				if rows.iter().any(|row| row.id != user_id) {
					return Err(field_error("phone", "already in use"));
				}

				user.phone = Some(new_phone.clone());
			}

			self.push_activity(&mut user, "changed phone", "local", req);

			self.store.put(&mut user).await?;

			info!("changed phone for user {}", user.id);

			self.events
				.emit(AuthEvent::PhoneChanged { user_id: user.id.clone() });

			Ok(())
		})
		.await
	}
}
