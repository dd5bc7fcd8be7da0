//! Documents and records exchanged with the stores

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single user document
///
/// Provider credential blobs (`<provider>: {auth, profile}`), the
/// configurable type field, and any custom model fields live in `extra`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct UserDoc {
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub id:              String,
	#[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
	pub rev:             Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub email:           Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub phone:           Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub username:        Option<String>,
	#[serde(
		rename = "unverifiedEmail",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub unverified_email: Option<UnverifiedEmail>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub providers:       Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub local:           Option<LocalAuth>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub roles:           Vec<String>,
	#[serde(rename = "signUp", default, skip_serializing_if = "Option::is_none")]
	pub sign_up:         Option<SignUpInfo>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub session:         BTreeMap<String, SessionEntry>,
	#[serde(
		rename = "personalDBs",
		default,
		skip_serializing_if = "BTreeMap::is_empty"
	)]
	pub personal_dbs:    BTreeMap<String, PersonalDb>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub activity:        Vec<ActivityEntry>,
	#[serde(
		rename = "forgotPassword",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub forgot_password: Option<ForgotPassword>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub profile:         Option<Value>,
	#[serde(flatten)]
	pub extra:           Map<String, Value>,
}

impl UserDoc {
	/// Read a provider credential blob from the document
	#[must_use]
	pub fn provider_info(&self, provider: &str) -> Option<ProviderInfo> {
		let value = self.extra.get(provider)?;

		serde_json::from_value(value.clone()).ok()
	}

	/// Attach or replace a provider credential blob
	pub fn set_provider_info(&mut self, provider: &str, info: &ProviderInfo) {
		if let Ok(value) = serde_json::to_value(info) {
			self.extra.insert(provider.to_string(), value);
		}
	}

	/// Drop a provider credential blob
	pub fn remove_provider_info(&mut self, provider: &str) {
		self.extra.remove(provider);
	}
}

/// Federated credentials and the provider profile they came with
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProviderInfo {
	pub auth:    Value,
	pub profile: Value,
}

/// Local password credentials and lockout counters
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LocalAuth {
	pub salt:                  String,
	pub derived_key:           String,
	#[serde(
		rename = "failedLoginAttempts",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub failed_login_attempts: Option<u32>,
	/// Millisecond timestamp until which local logins are refused
	#[serde(
		rename = "lockedUntil",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub locked_until:          Option<i64>,
}

/// An email address pending confirmation
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UnverifiedEmail {
	pub email: String,
	pub token: String,
}

/// Hashed forgot-password token and its validity window
///
/// Only the salted hash of the emailed token is ever persisted.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ForgotPassword {
	pub token:   String,
	pub issued:  i64,
	pub expires: i64,
}

/// Where and when the account was first registered
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignUpInfo {
	pub provider:  String,
	pub timestamp: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip:        Option<String>,
}

/// An active session as recorded on the user document
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionEntry {
	pub issued:   i64,
	pub expires:  i64,
	pub provider: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip:       Option<String>,
}

/// Whether a personal DB is unique to the user or shared across users
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
	#[default]
	Private,
	Shared,
}

/// A personal DB entry, keyed on the document by physical DB name
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PersonalDb {
	/// Logical (prefix-stripped) name
	pub name:         String,
	#[serde(rename = "type")]
	pub db_type:      DbType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub permissions:  Option<Vec<String>>,
	#[serde(
		rename = "adminRoles",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub admin_roles:  Option<Vec<String>>,
	#[serde(
		rename = "memberRoles",
		default,
		skip_serializing_if = "Option::is_none"
	)]
	pub member_roles: Option<Vec<String>>,
}

/// One audit log entry, newest first on the document
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ActivityEntry {
	pub timestamp: DateTime<Utc>,
	pub action:    String,
	pub provider:  String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip:        Option<String>,
}

/// A session token record as held by the session store
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionToken {
	#[serde(rename = "_id")]
	pub user_id:  String,
	pub key:      String,
	pub password: String,
	pub issued:   i64,
	pub expires:  i64,
	pub provider: String,
	pub roles:    Vec<String>,
}

/// The minimal user view returned by `confirm_token`
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionUser {
	#[serde(rename = "_id")]
	pub id:    String,
	pub roles: Vec<String>,
	pub key:   String,
}

/// The payload returned to a freshly authenticated client
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SessionResponse {
	pub token:      String,
	pub password:   String,
	pub user_id:    String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_email: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_phone: Option<String>,
	pub roles:      Vec<String>,
	pub issued:     i64,
	pub expires:    i64,
	pub provider:   String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip:         Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub profile:    Option<Value>,
	/// Logical DB name to credentialed URL
	#[serde(rename = "userDBs")]
	pub user_dbs:   BTreeMap<String, String>,
}

/// One half of a security document
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityRoleSet {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub names: Vec<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub roles: Vec<String>,
}

/// A database security document
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SecurityDoc {
	#[serde(default)]
	pub admins:  SecurityRoleSet,
	#[serde(default)]
	pub members: SecurityRoleSet,
}

impl SecurityDoc {
	/// Grant a key membership; idempotent
	pub fn add_member_name(&mut self, name: &str) -> bool {
		if self.members.names.iter().any(|n| n == name) {
			return false;
		}

		self.members.names.push(name.to_string());

		true
	}

	/// Revoke a key's membership; idempotent
	pub fn remove_member_names(&mut self, names: &[String]) -> bool {
		let before = self.members.names.len();
		self.members.names.retain(|n| !names.contains(n));

		self.members.names.len() != before
	}
}

/// A single map view inside a design document
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DesignView {
	pub map: String,
}

/// A design document holding the index views of a database
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DesignDoc {
	#[serde(rename = "_id")]
	pub id:       String,
	#[serde(default = "default_language")]
	pub language: String,
	pub views:    BTreeMap<String, DesignView>,
}

fn default_language() -> String {
	"javascript".to_string()
}

/// A per-session credential as written to the DB auth store
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct KeyRecord {
	pub key:         String,
	pub user_id:     String,
	pub salt:        String,
	pub derived_key: String,
	pub expires:     i64,
	pub roles:       Vec<String>,
}

/// An API key minted by the backing service itself
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiKey {
	pub key:      String,
	pub password: String,
}

/// Request metadata supplied by the HTTP layer
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
	pub ip:             Option<String>,
	/// `inviteCode` query parameter, when present
	pub invite_code:    Option<String>,
	/// Whether the request solved a captcha challenge
	pub captcha_passed: bool,
	/// Session key the request authenticated with, when any
	pub session_key:    Option<String>,
}

impl RequestContext {
	/// A context carrying only a client ip
	#[must_use]
	pub fn from_ip(ip: &str) -> Self {
		Self { ip: Some(ip.to_string()), ..Self::default() }
	}
}
