//! Library-wide error types and [`From`] impls

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Per-field validation messages, keyed by field name
pub type ValidationErrors = HashMap<String, Vec<String>>;

/// Top level application error, can be converted into a [`WireError`]
#[derive(Debug, Error)]
pub enum Error {
	/// One or more fields failed schema validation
	#[error("Validation failed")]
	Validation(ValidationErrors),
	/// Any error related to logging in
	#[error(transparent)]
	Login(#[from] LoginError),
	/// A resource is already claimed by another user
	#[error(transparent)]
	Conflict(#[from] ConflictError),
	/// Registration requires a valid invite code
	#[error("An invite code is required to register")]
	MissingInviteCode,
	/// Invalid or expired one-time token
	#[error(transparent)]
	Token(#[from] TokenError),
	/// Any error related to changing a password
	#[error(transparent)]
	PasswordChange(#[from] PasswordChangeError),
	/// An account-level constraint would be violated
	#[error(transparent)]
	Account(#[from] AccountError),
	/// Resource not found
	#[error(transparent)]
	NotFound(#[from] NotFoundError),
	/// The document revision was stale when persisting
	#[error("document revision conflict")]
	RevisionConflict,
	/// Opaque internal server error
	#[error("internal server error")]
	Internal,
}

impl Error {
	/// Return the stable wire key identifying this error
	///
	/// Keys are part of the public contract and must never change once
	/// assigned, including the misspelled `missing_current_passowrd`.
	#[must_use]
	pub fn key(&self) -> String {
		match self {
			Self::Validation(_) => "validation_failed".to_string(),
			Self::Login(e) => {
				match e {
					LoginError::Unauthorized => "unauthorized",
					LoginError::FailedLogin => "failed_login",
					LoginError::SoftLocked => "soft_locked",
					LoginError::MissingCaptcha => "missing_captcha",
					LoginError::EmailUnconfirmed => "email_unconfirmed",
					LoginError::Locked { .. } => "locked",
				}
				.to_string()
			},
			Self::Conflict(e) => {
				match e {
					ConflictError::ProviderInUse(p) => format!("inuse_{p}"),
					ConflictError::ProviderConflict(p) => {
						format!("conflict_{p}")
					},
					ConflictError::EmailInUse => "inuse_email".to_string(),
					ConflictError::EmailInUseLink => {
						"inuse_email_link".to_string()
					},
				}
			},
			Self::MissingInviteCode => "missing_invite_code".to_string(),
			Self::Token(e) => {
				match e {
					TokenError::Invalid => "invalid_token",
					TokenError::Expired => "expired_token",
					TokenError::InvalidEmailVerification => "invalidToken",
				}
				.to_string()
			},
			Self::PasswordChange(e) => {
				match e {
					PasswordChangeError::MissingCurrentPassword => {
						"missing_current_passowrd"
					},
					PasswordChangeError::InvalidCurrentPassword => {
						"invalid_current_password"
					},
				}
				.to_string()
			},
			Self::Account(e) => {
				match e {
					AccountError::OnlyLoginCredential => {
						"only_login_credential"
					},
					AccountError::PasswordNotSet => "password_not_set",
					AccountError::UnlinkOnlyProvider => "unlink_only_provider",
					AccountError::UnlinkLocal => "unlink_local",
					AccountError::MissingProviderToUnlink => {
						"missing_provider_to_unlink"
					},
				}
				.to_string()
			},
			Self::NotFound(e) => {
				match e {
					NotFoundError::Username => "username_not_found",
					NotFoundError::Provider => "provider_not_found",
				}
				.to_string()
			},
			Self::RevisionConflict | Self::Internal => {
				"internal_error".to_string()
			},
		}
	}

	/// Return the HTTP status code for this error
	#[must_use]
	pub fn status(&self) -> u16 {
		match self {
			Self::Validation(_)
			| Self::MissingInviteCode
			| Self::Token(_)
			| Self::PasswordChange(_)
			| Self::Account(_) => 400,
			Self::Login(_) => 401,
			Self::NotFound(_) => 404,
			Self::Conflict(_) => 409,
			Self::RevisionConflict | Self::Internal => 500,
		}
	}

	/// Whether this error marks the account as locked out
	#[must_use]
	pub fn locked(&self) -> bool {
		matches!(
			self,
			Self::Login(LoginError::Locked { .. } | LoginError::SoftLocked)
		)
	}

	/// Convert this error into the serializable wire shape
	#[must_use]
	pub fn to_wire(&self) -> WireError {
		let validation_errors = match self {
			Self::Validation(errors) => Some(errors.clone()),
			_ => None,
		};

		WireError {
			error: reason_phrase(self.status()).to_string(),
			key: self.key(),
			message: self.to_string(),
			status: self.status(),
			validation_errors,
			locked: if self.locked() { Some(true) } else { None },
		}
	}
}

/// The serialized error shape exchanged with API consumers
#[derive(Clone, Debug, Serialize)]
pub struct WireError {
	pub error:             String,
	pub key:               String,
	pub message:           String,
	pub status:            u16,
	#[serde(rename = "validationErrors")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub validation_errors: Option<ValidationErrors>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub locked:            Option<bool>,
}

fn reason_phrase(status: u16) -> &'static str {
	match status {
		400 => "Bad Request",
		401 => "Unauthorized",
		404 => "Not Found",
		409 => "Conflict",
		_ => "Internal Server Error",
	}
}

/// Any error related to logging in
#[derive(Debug, Error)]
pub enum LoginError {
	#[error("Unauthorized")]
	Unauthorized,
	#[error("Invalid username or password")]
	FailedLogin,
	#[error(
		"Your account is temporarily locked, please solve the captcha to \
		 continue"
	)]
	SoftLocked,
	#[error("Captcha is required to unlock a temporarily locked account")]
	MissingCaptcha,
	#[error("You must confirm your email address before logging in")]
	EmailUnconfirmed,
	#[error(
		"Maximum failed login attempts exceeded. Your account has been locked \
		 for {minutes} minutes"
	)]
	Locked { minutes: i64 },
}

/// A resource is already claimed by another user
#[derive(Debug, Error)]
pub enum ConflictError {
	#[error("This {0} account is already in use by another user")]
	ProviderInUse(String),
	#[error("Your account is already linked to another {0} profile")]
	ProviderConflict(String),
	#[error("Email is already in use")]
	EmailInUse,
	#[error(
		"The email address on this profile is already in use by another \
		 account"
	)]
	EmailInUseLink,
}

/// Invalid or expired one-time token
#[derive(Debug, Error)]
pub enum TokenError {
	#[error("Invalid token")]
	Invalid,
	#[error("Token has expired")]
	Expired,
	#[error("Invalid email verification token")]
	InvalidEmailVerification,
}

/// Any error related to changing a password
#[derive(Debug, Error)]
pub enum PasswordChangeError {
	#[error("You must supply your current password in order to change it")]
	MissingCurrentPassword,
	#[error("The current password you supplied is incorrect")]
	InvalidCurrentPassword,
}

/// An account-level constraint would be violated
#[derive(Debug, Error)]
pub enum AccountError {
	#[error("You cannot set your only login credential to null!")]
	OnlyLoginCredential,
	#[error("You must set a password before you can change this credential")]
	PasswordNotSet,
	#[error("You cannot unlink your only sign-in provider")]
	UnlinkOnlyProvider,
	#[error("Local credentials cannot be unlinked")]
	UnlinkLocal,
	#[error("You must specify a provider to unlink")]
	MissingProviderToUnlink,
}

/// Resource not found
#[derive(Debug, Error)]
pub enum NotFoundError {
	#[error("User not found")]
	Username,
	#[error("Provider not found")]
	Provider,
}

/// A list of possible internal errors
///
/// API end users should never see these details
#[derive(Debug, Error)]
pub enum InternalError {
	/// Error hashing some value
	#[error("hash error -- {0:?}")]
	HashError(argon2::password_hash::Error),
	/// Error executing some redis operation
	#[error("redis error -- {0:?}")]
	RedisError(redis::RedisError),
	/// Error related to `serde_json`
	#[error("serde_json error -- {0:?}")]
	SerdeJsonError(serde_json::Error),
	/// Error handling some form of I/O
	#[error("I/O error -- {0:?}")]
	IoError(std::io::Error),
	/// Malformed email
	#[error("invalid email -- {0:?}")]
	InvalidEmail(lettre::address::AddressError),
	/// Mailer stopped unexpectedly
	#[error("mailer stopped -- {0:?}")]
	MailerStopped(mpsc::error::SendError<lettre::Message>),
	/// Mail queue is full
	#[error("mail queue full -- {0:?}")]
	MailQueueFull(mpsc::error::TrySendError<lettre::Message>),
	/// Generic mailer error
	#[error("mail error -- {0:?}")]
	MailError(lettre::error::Error),
	/// Failed to parse a url
	#[error("could not parse url -- {0:?}")]
	UrlParseError(url::ParseError),
	/// A store adapter failed in a backend-specific way
	#[error("store error -- {0}")]
	StoreError(String),
}

// Map internal server errors to application errors
impl From<InternalError> for Error {
	fn from(value: InternalError) -> Self {
		error!("internal server error -- {value}");

		Self::Internal
	}
}

/// Map password hashing errors to application errors
impl From<argon2::password_hash::Error> for Error {
	fn from(err: argon2::password_hash::Error) -> Self {
		match err {
			argon2::password_hash::Error::Password => {
				LoginError::FailedLogin.into()
			},
			_ => InternalError::HashError(err).into(),
		}
	}
}

impl From<redis::RedisError> for Error {
	fn from(err: redis::RedisError) -> Self {
		InternalError::RedisError(err).into()
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		InternalError::SerdeJsonError(err).into()
	}
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		InternalError::IoError(err).into()
	}
}

impl From<lettre::address::AddressError> for Error {
	fn from(err: lettre::address::AddressError) -> Self {
		InternalError::InvalidEmail(err).into()
	}
}

impl From<mpsc::error::SendError<lettre::Message>> for Error {
	fn from(err: mpsc::error::SendError<lettre::Message>) -> Self {
		InternalError::MailerStopped(err).into()
	}
}

impl From<mpsc::error::TrySendError<lettre::Message>> for Error {
	fn from(err: mpsc::error::TrySendError<lettre::Message>) -> Self {
		InternalError::MailQueueFull(err).into()
	}
}

impl From<lettre::error::Error> for Error {
	fn from(err: lettre::error::Error) -> Self {
		InternalError::MailError(err).into()
	}
}

impl From<url::ParseError> for Error {
	fn from(err: url::ParseError) -> Self {
		InternalError::UrlParseError(err).into()
	}
}
