//! Shared test harness: memory-backed stores, stub mailer, canned config

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use couchguard::config::{EmailTemplate, UsernameKey};
use couchguard::models::RequestContext;
use couchguard::session::MemorySessionStore;
use couchguard::store::{MemoryServer, MemoryUserStore};
use couchguard::{
	Config,
	DbAuth,
	EventBus,
	Mailer,
	StubMailbox,
	UserService,
};
use serde_json::{Map, Value, json};

pub struct TestEnv {
	pub service: UserService,
	pub config:  Arc<Config>,
	pub store:   Arc<MemoryUserStore>,
	pub session: Arc<MemorySessionStore>,
	pub server:  Arc<MemoryServer>,
	pub mailbox: Arc<StubMailbox>,
	pub events:  EventBus,
}

/// A config with every email template registered and mail stubbed out
pub fn base_config() -> Config {
	let mut config = Config::default();

	config.local.username_keys =
		vec![UsernameKey::Email, UsernameKey::Username];
	config.mailer.from_email = "noreply@example.com".to_string();
	config.test_mode.no_email = true;

	config.emails = HashMap::from([
		(
			"confirmEmail".to_string(),
			EmailTemplate {
				subject:  "Confirm your email".to_string(),
				template: "Confirm with token {token}".to_string(),
				format:   None,
			},
		),
		(
			"forgotPassword".to_string(),
			EmailTemplate {
				subject:  "Reset your password".to_string(),
				template: "Reset with token {token}".to_string(),
				format:   None,
			},
		),
	]);

	config
}

/// Install the tracing subscriber once per test binary
fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_test_writer()
		.with_max_level(tracing::Level::DEBUG)
		.try_init();
}

/// Wire up a full user service over memory adapters
pub async fn build_env(config: Config) -> TestEnv {
	build_env_with_server(config, MemoryServer::new()).await
}

pub async fn build_env_with_server(
	config: Config,
	server: MemoryServer,
) -> TestEnv {
	init_tracing();

	let config = Arc::new(config);
	let store = Arc::new(MemoryUserStore::new());
	let session = Arc::new(MemorySessionStore::new());
	let server = Arc::new(server);
	let mailbox = Arc::new(StubMailbox::default());
	let events = EventBus::default();

	let db_auth = DbAuth::new(config.clone(), server.clone());
	let mailer =
		Mailer::new(config.clone(), Some(mailbox.clone())).unwrap();

	let service = UserService::new(
		config.clone(),
		store.clone(),
		session.clone(),
		db_auth,
		mailer,
		events.clone(),
	);

	service.initialize().await.unwrap();

	TestEnv { service, config, store, session, server, mailbox, events }
}

/// A minimal registration form
pub fn register_form(login: &str, password: &str) -> Map<String, Value> {
	let mut form = Map::new();
	form.insert("username".to_string(), json!(login));
	form.insert("password".to_string(), json!(password));
	form.insert("confirmPassword".to_string(), json!(password));

	form
}

pub fn req() -> RequestContext {
	RequestContext::from_ip("127.0.0.1")
}

/// Wait until the stub mailbox holds at least `count` messages
pub async fn wait_for_mail(mailbox: &StubMailbox, count: usize) {
	for _ in 0..100 {
		if mailbox.len() >= count {
			return;
		}

		tokio::time::sleep(Duration::from_millis(10)).await;
	}

	panic!("expected {count} mails, found {}", mailbox.len());
}

/// Formatted contents of every message in the stub mailbox
pub fn mail_bodies(mailbox: &StubMailbox) -> Vec<String> {
	mailbox
		.mailbox
		.lock()
		.iter()
		.map(|mail| String::from_utf8_lossy(&mail.formatted()).to_string())
		.collect()
}

/// Pull the `{token}` substitution back out of a templated mail body
pub fn token_from_mail(body: &str, prefix: &str) -> String {
	let start = body.find(prefix).expect("token prefix not found in mail")
		+ prefix.len();

	body[start..]
		.chars()
		.take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
		.collect()
}
