//! Thin adapters binding authentication schemes to the user service

use chrono::Utc;

use crate::error::{Error, LoginError, TokenError};
use crate::models::{RequestContext, SessionUser, UserDoc};
use crate::user::UserService;
use crate::util::verify_password;

/// Authenticate a `"<key>:<password>"` bearer credential
///
/// # Errors
/// Fails with an invalid-token error on malformed input, unauthorized on
/// a bad or expired session
pub async fn bearer(
	service: &UserService,
	credentials: &str,
) -> Result<SessionUser, Error> {
	let Some((key, password)) = credentials.split_once(':') else {
		return Err(TokenError::Invalid.into());
	};

	if key.is_empty() || password.is_empty() {
		return Err(TokenError::Invalid.into());
	}

	service.confirm_session(key, password).await
}

/// Authenticate a local login/password pair
///
/// Applies the lockout policy: failed attempts count towards a lock, and
/// locked accounts can only proceed through the captcha gate when soft
/// locking is enabled.
///
/// # Errors
/// Fails with one of the login error states of the account state machine
#[instrument(skip(service, password, req))]
pub async fn local(
	service: &UserService,
	login: &str,
	password: &str,
	req: &RequestContext,
) -> Result<UserDoc, Error> {
	let Some(user) = service.get(login).await? else {
		return Err(LoginError::FailedLogin.into());
	};

	let security = &service.config.security;

	let locked_until =
		user.local.as_ref().and_then(|local| local.locked_until);

	if let Some(until) = locked_until
		&& until > Utc::now().timestamp_millis()
	{
		if !security.soft_lock {
			return Err(LoginError::SoftLocked.into());
		}

		if !req.captcha_passed {
			return Err(LoginError::MissingCaptcha.into());
		}
	}

	let Some(local) = &user.local else {
		return Err(LoginError::FailedLogin.into());
	};

	if local.derived_key.is_empty() {
		return Err(LoginError::FailedLogin.into());
	}

	match verify_password(&local.derived_key, password) {
		Ok(()) => {
			if service.config.local.require_email_confirm
				&& user.email.is_none()
			{
				return Err(LoginError::EmailUnconfirmed.into());
			}

			Ok(user)
		},
		Err(Error::Login(LoginError::FailedLogin)) => {
			let locked = service.handle_failed_login(&user.id, req).await?;

			if locked {
				let minutes = (security.lockout_time / 60).max(1);

				Err(LoginError::Locked { minutes }.into())
			} else {
				Err(LoginError::FailedLogin.into())
			}
		},
		Err(e) => Err(e),
	}
}
