//! Static configuration for the user & session core
//!
//! The embedding application is responsible for loading this tree (from
//! files, environment, or CLI); the core only ever reads it.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validate::Schema;

/// Identity fields usable as a login identifier
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsernameKey {
	Username,
	Email,
	Phone,
}

impl UsernameKey {
	/// The document field this key reads
	#[must_use]
	pub fn field(self) -> &'static str {
		match self {
			Self::Username => "username",
			Self::Email => "email",
			Self::Phone => "phone",
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
	pub security:   SecurityConfig,
	pub local:      LocalConfig,
	pub mailer:     MailerConfig,
	/// Email templates keyed by template key (`confirmEmail`,
	/// `forgotPassword`, `confirmEmailChange`, ...)
	pub emails:     HashMap<String, EmailTemplate>,
	pub db_server:  DbServerConfig,
	pub session:    SessionConfig,
	#[serde(rename = "userDBs")]
	pub user_dbs:   UserDbsConfig,
	/// Extension of the base user model schema
	pub user_model: Option<Schema>,
	/// Provider settings, consumed by the external OAuth layer only
	pub providers:  HashMap<String, Value>,
	pub test_mode:  TestModeConfig,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			security:   SecurityConfig::default(),
			local:      LocalConfig::default(),
			mailer:     MailerConfig::default(),
			emails:     HashMap::new(),
			db_server:  DbServerConfig::default(),
			session:    SessionConfig::default(),
			user_dbs:   UserDbsConfig::default(),
			user_model: None,
			providers:  HashMap::new(),
			test_mode:  TestModeConfig::default(),
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityConfig {
	/// Roles assigned to every new user
	pub default_roles:            Vec<String>,
	/// Maximum number of entries kept in the per-user activity log
	pub user_activity_log_size:   usize,
	/// Require a valid invite code on registration
	pub invite_only_registration: bool,
	/// Failed local logins before the account is locked; `None` disables
	/// lockout entirely
	pub max_failed_logins:        Option<u32>,
	/// Lockout duration in seconds
	pub lockout_time:             i64,
	/// Allow captcha-gated logins while an account is locked
	pub soft_lock:                bool,
	/// Lifetime of one-time tokens (password reset), in seconds
	pub token_life:               i64,
	/// Lifetime of session tokens, in seconds
	pub session_life:             i64,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		Self {
			default_roles:            vec!["user".to_string()],
			user_activity_log_size:   10,
			invite_only_registration: false,
			max_failed_logins:        None,
			lockout_time:             600,
			soft_lock:                false,
			token_life:               86400,
			session_life:             86400,
		}
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalConfig {
	/// Treat the email address as the username
	pub email_username:        bool,
	/// Which identity fields may be used to log in, in matching order
	pub username_keys:         Vec<UsernameKey>,
	/// Form field holding the login identifier
	pub username_field:        String,
	/// Form field holding the password
	pub password_field:        String,
	/// Park new email addresses in `unverifiedEmail` and send a
	/// confirmation link
	pub send_confirm_email:    bool,
	/// Refuse local logins until the email address is confirmed
	pub require_email_confirm: bool,
	/// Assign fresh 32-hex ids instead of renaming the username to `_id`
	pub uuid_as_id:            bool,
	/// Overrides the built-in phone number pattern
	pub phone_regexp:          Option<String>,
}

impl Default for LocalConfig {
	fn default() -> Self {
		Self {
			email_username:        false,
			username_keys:         vec![UsernameKey::Username],
			username_field:        "username".to_string(),
			password_field:        "password".to_string(),
			send_confirm_email:    false,
			require_email_confirm: false,
			uuid_as_id:            false,
			phone_regexp:          None,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MailerConfig {
	pub from_email:    String,
	/// SMTP relay host; the stub transport is used when empty
	pub smtp_server:   String,
	pub smtp_password: String,
	/// Outgoing mail queue capacity
	pub queue_size:    Option<usize>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
	pub subject:  String,
	/// Body with `{placeholder}` substitutions
	pub template: String,
	#[serde(default)]
	pub format:   Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DbServerConfig {
	pub protocol:   String,
	pub host:       String,
	pub user:       String,
	pub password:   String,
	/// Base URL handed out to clients for their personal DBs; falls back
	/// to the internal URL when unset
	#[serde(rename = "publicURL")]
	pub public_url: Option<String>,
	/// Name of the document field holding the document type
	pub type_field: String,
	/// Let the backing service mint API keys instead of generating
	/// session keys locally
	pub cloudant:   bool,
}

impl Default for DbServerConfig {
	fn default() -> Self {
		Self {
			protocol:   "http://".to_string(),
			host:       "localhost:5984".to_string(),
			user:       String::new(),
			password:   String::new(),
			public_url: None,
			type_field: "type".to_string(),
			cloudant:   false,
		}
	}
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionAdapter {
	#[default]
	Memory,
	File,
	Redis,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
	pub adapter:         SessionAdapter,
	pub file:            FileSessionConfig,
	pub redis:           RedisSessionConfig,
	/// Ordered profile field mapping; the first listed provider carrying
	/// the source field wins
	pub profile_mapping: Vec<ProfileMapEntry>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FileSessionConfig {
	pub sessions_root: PathBuf,
}

impl Default for FileSessionConfig {
	fn default() -> Self {
		Self { sessions_root: PathBuf::from("./sessions") }
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RedisSessionConfig {
	pub url: String,
}

impl Default for RedisSessionConfig {
	fn default() -> Self {
		Self { url: "redis://localhost:6379".to_string() }
	}
}

/// One synthesized profile field and its ordered sources
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMapEntry {
	pub field:   String,
	pub sources: Vec<ProfileSource>,
}

/// A provider profile field a mapped field may be read from
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSource {
	pub provider: String,
	pub key:      String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserDbsConfig {
	pub default_security_roles: SecurityRoles,
	/// Per-DB model settings; the `_default` entry applies to every DB
	pub model:                  HashMap<String, DbModelConfig>,
	#[serde(rename = "defaultDBs")]
	pub default_dbs:            DefaultDbsConfig,
	/// Prefix of physical private DB names
	pub private_prefix:         String,
	/// Directory holding design document JSON files
	pub design_doc_dir:         Option<PathBuf>,
}

impl Default for UserDbsConfig {
	fn default() -> Self {
		Self {
			default_security_roles: SecurityRoles::default(),
			model:                  HashMap::new(),
			default_dbs:            DefaultDbsConfig::default(),
			private_prefix:         "userdb".to_string(),
			design_doc_dir:         None,
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityRoles {
	pub admins:  Vec<String>,
	pub members: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DefaultDbsConfig {
	pub private: Vec<String>,
	pub shared:  Vec<String>,
}

/// Per-DB configuration, merged over the `_default` model entry
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DbModelConfig {
	#[serde(rename = "type")]
	pub db_type:      Option<String>,
	pub permissions:  Option<Vec<String>>,
	pub admin_roles:  Option<Vec<String>>,
	pub member_roles: Option<Vec<String>>,
	pub design_docs:  Option<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TestModeConfig {
	/// The mailer reports success without sending anything
	pub no_email: bool,
}
