//! Password hashing, identifiers, and other small shared helpers

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::DbServerConfig;
use crate::error::Error;
use crate::models::{DesignDoc, DesignView, UserDoc};

/// A freshly derived password hash
#[derive(Clone, Debug)]
pub struct HashedPassword {
	pub salt:        String,
	pub derived_key: String,
}

/// Hash a plaintext password with a fresh random salt
///
/// # Errors
/// Fails if the underlying hasher rejects its input
pub fn hash_password(password: &str) -> Result<HashedPassword, Error> {
	let salt = SaltString::generate(&mut OsRng);
	let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;

	Ok(HashedPassword { salt: salt.to_string(), derived_key: hash.to_string() })
}

/// Verify a plaintext password against a stored derived key
///
/// Comparison happens in constant time inside the hasher; a mismatch is
/// reported as a benign failed-login error.
///
/// # Errors
/// Fails with [`crate::error::LoginError::FailedLogin`] on mismatch
pub fn verify_password(derived_key: &str, password: &str) -> Result<(), Error> {
	let parsed = PasswordHash::new(derived_key)?;

	Argon2::default().verify_password(password.as_bytes(), &parsed)?;

	Ok(())
}

/// Generate a 128-bit URL-safe identifier (base64url, no padding)
///
/// Callers storing the result as a credential key must re-roll values with
/// a leading `_` or `-`; see [`key_uuid`].
#[must_use]
pub fn url_safe_uuid() -> String {
	URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

/// Generate a URL-safe identifier that never starts with `_` or `-`
///
/// The downstream credential store reserves those prefixes.
#[must_use]
pub fn key_uuid() -> String {
	loop {
		let key = url_safe_uuid();

		if !key.starts_with('_') && !key.starts_with('-') {
			return key;
		}
	}
}

/// One-way deterministic digest of a one-time token
#[must_use]
pub fn hash_token(token: &str) -> String {
	hex::encode(Sha256::digest(token.as_bytes()))
}

/// Assemble the DB server URL, embedding credentials when configured
#[must_use]
pub fn get_db_url(config: &DbServerConfig) -> String {
	if config.user.is_empty() {
		format!("{}{}", config.protocol, config.host)
	} else {
		format!(
			"{}{}:{}@{}",
			config.protocol, config.user, config.password, config.host
		)
	}
}

/// Assemble the credentialed URL a client uses to reach one of its DBs
#[must_use]
pub fn session_db_url(
	config: &DbServerConfig,
	db_name: &str,
	key: &str,
	password: &str,
) -> String {
	match &config.public_url {
		Some(public) => {
			let base = public.trim_end_matches('/');

			match base.split_once("://") {
				Some((scheme, rest)) => {
					format!("{scheme}://{key}:{password}@{rest}/{db_name}")
				},
				None => format!("{base}/{db_name}"),
			}
		},
		None => {
			format!(
				"{}{}:{}@{}/{}",
				config.protocol, key, password, config.host, db_name
			)
		},
	}
}

/// All session keys recorded on a user document
#[must_use]
pub fn get_sessions(user: &UserDoc) -> Vec<String> {
	user.session.keys().cloned().collect()
}

/// Session keys on a user document that expired before `now` (ms)
#[must_use]
pub fn get_expired_sessions(user: &UserDoc, now: i64) -> Vec<String> {
	user.session
		.iter()
		.filter(|(_, entry)| entry.expires < now)
		.map(|(key, _)| key.clone())
		.collect()
}

/// Build the `_design/auth` document with the core lookup views
#[must_use]
pub fn auth_design_doc() -> DesignDoc {
	let mut doc = DesignDoc {
		id:       "_design/auth".to_string(),
		language: "javascript".to_string(),
		views:    Default::default(),
	};

	let views = [
		(
			"username",
			"function(doc) { if (doc.username) { emit(doc.username, null); } }",
		),
		(
			"email",
			"function(doc) { if (doc.email) { emit(doc.email, null); } if \
			 (doc.unverifiedEmail && doc.unverifiedEmail.email) { \
			 emit(doc.unverifiedEmail.email, null); } }",
		),
		(
			"phone",
			"function(doc) { if (doc.phone) { emit(doc.phone, null); } }",
		),
		(
			"emailUsername",
			"function(doc) { if (doc.email) { emit(doc.email, null); } if \
			 (doc.username) { emit(doc.username, null); } if \
			 (doc.unverifiedEmail && doc.unverifiedEmail.email) { \
			 emit(doc.unverifiedEmail.email, null); } }",
		),
		(
			"passwordReset",
			"function(doc) { if (doc.forgotPassword && \
			 doc.forgotPassword.token) { emit(doc.forgotPassword.token, null); \
			 } }",
		),
		(
			"verifyEmail",
			"function(doc) { if (doc.unverifiedEmail && \
			 doc.unverifiedEmail.token) { emit(doc.unverifiedEmail.token, \
			 null); } }",
		),
		(
			"session",
			"function(doc) { if (doc.session) { for (var key in doc.session) { \
			 emit(key, null); } } }",
		),
	];

	for (name, map) in views {
		doc.views.insert(name.to_string(), DesignView { map: map.to_string() });
	}

	doc
}

/// Inject provider-indexed views into a design document
pub fn add_provider_views(doc: &mut DesignDoc, providers: &[String]) {
	for provider in providers {
		if provider == "local" || doc.views.contains_key(provider) {
			continue;
		}

		let map = format!(
			"function(doc) {{ if (doc.{provider} && doc.{provider}.profile) {{ \
			 emit(doc.{provider}.profile.id, null); }} }}"
		);

		doc.views.insert(provider.clone(), DesignView { map });
	}
}
