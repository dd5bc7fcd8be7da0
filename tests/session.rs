mod common;

use common::{base_config, build_env, build_env_with_server, register_form, req};
use couchguard::error::Error;
use couchguard::store::MemoryServer;
use couchguard::{AuthEvent, SessionStore, UserStore, strategies};

#[tokio::test(flavor = "multi_thread")]
async fn create_session_returns_full_payload() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	assert_eq!(response.user_id, user.id);
	assert_eq!(response.user_email.as_deref(), Some("bob@example.com"));
	assert_eq!(response.provider, "local");
	assert_eq!(response.roles, vec!["user".to_string()]);
	assert!(!response.token.is_empty());
	assert!(!response.password.is_empty());
	assert!(response.expires > response.issued);
	assert!(!response.token.starts_with('_'));
	assert!(!response.token.starts_with('-'));
}

#[tokio::test(flavor = "multi_thread")]
async fn session_appears_in_all_three_stores() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	// Session store token with matching expiry
	let token = env
		.session
		.fetch_token(&response.token)
		.await
		.unwrap()
		.unwrap();
	assert_eq!(token.expires, response.expires);

	// DB auth store credential
	assert!(env.server.key_names().contains(&response.token));

	// User document session entry
	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert_eq!(stored.session[&response.token].expires, response.expires);
}

#[tokio::test(flavor = "multi_thread")]
async fn confirm_session_round_trip() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	let confirmed = env
		.service
		.confirm_session(&response.token, &response.password)
		.await
		.unwrap();

	assert_eq!(confirmed.id, user.id);
	assert_eq!(confirmed.roles, vec!["user".to_string()]);

	let err = env
		.service
		.confirm_session(&response.token, "wrong")
		.await
		.unwrap_err();
	assert_eq!(err.key(), "unauthorized");
	assert_eq!(err.status(), 401);
}

#[tokio::test(flavor = "multi_thread")]
async fn bearer_strategy() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	let credentials =
		format!("{}:{}", response.token, response.password);
	let confirmed =
		strategies::bearer(&env.service, &credentials).await.unwrap();
	assert_eq!(confirmed.id, user.id);

	let err = strategies::bearer(&env.service, "garbage").await.unwrap_err();
	assert_eq!(err.key(), "invalid_token");
}

#[tokio::test(flavor = "multi_thread")]
async fn local_strategy_success_and_failure() {
	let env = build_env(base_config()).await;

	env.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let user =
		strategies::local(&env.service, "bob@example.com", "secret", &req())
			.await
			.unwrap();
	assert_eq!(user.email.as_deref(), Some("bob@example.com"));

	let err =
		strategies::local(&env.service, "bob@example.com", "wrong", &req())
			.await
			.unwrap_err();
	assert_eq!(err.key(), "failed_login");

	let err =
		strategies::local(&env.service, "nobody@example.com", "x", &req())
			.await
			.unwrap_err();
	assert_eq!(err.key(), "failed_login");
}

#[tokio::test(flavor = "multi_thread")]
async fn lockout_after_repeated_failures() {
	let mut config = base_config();
	config.security.max_failed_logins = Some(3);
	config.security.lockout_time = 60;

	let env = build_env(config).await;

	env.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	for _ in 0..3 {
		let err = strategies::local(
			&env.service,
			"bob@example.com",
			"wrong",
			&req(),
		)
		.await
		.unwrap_err();

		assert_eq!(err.key(), "failed_login");
	}

	let err =
		strategies::local(&env.service, "bob@example.com", "wrong", &req())
			.await
			.unwrap_err();
	assert_eq!(err.key(), "locked");
	assert!(err.locked());

	// Even the right password is refused while the lock holds
	let err =
		strategies::local(&env.service, "bob@example.com", "secret", &req())
			.await
			.unwrap_err();
	assert_eq!(err.key(), "soft_locked");
}

#[tokio::test(flavor = "multi_thread")]
async fn soft_lock_requires_captcha() {
	let mut config = base_config();
	config.security.max_failed_logins = Some(1);
	config.security.lockout_time = 60;
	config.security.soft_lock = true;

	let env = build_env(config).await;

	env.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	for _ in 0..2 {
		let _ = strategies::local(
			&env.service,
			"bob@example.com",
			"wrong",
			&req(),
		)
		.await;
	}

	let err =
		strategies::local(&env.service, "bob@example.com", "secret", &req())
			.await
			.unwrap_err();
	assert_eq!(err.key(), "missing_captcha");

	let mut captcha_req = req();
	captcha_req.captcha_passed = true;

	let user = strategies::local(
		&env.service,
		"bob@example.com",
		"secret",
		&captcha_req,
	)
	.await
	.unwrap();
	assert_eq!(user.email.as_deref(), Some("bob@example.com"));
}

#[tokio::test(flavor = "multi_thread")]
async fn successful_login_resets_lockout_counters() {
	let mut config = base_config();
	config.security.max_failed_logins = Some(3);

	let env = build_env(config).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let _ = strategies::local(&env.service, "bob@example.com", "wrong", &req())
		.await;

	env.service.create_session(&user.id, "local", &req()).await.unwrap();

	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	let local = stored.local.as_ref().unwrap();
	assert_eq!(local.failed_login_attempts, Some(0));
	assert_eq!(local.locked_until, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn refresh_extends_only_the_given_session() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let first =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();
	let second =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();

	tokio::time::sleep(std::time::Duration::from_millis(20)).await;

	let mut events = env.events.subscribe();
	let refreshed = env.service.refresh_session(&first.token).await.unwrap();

	assert!(refreshed.expires > first.expires);

	let session_life =
		env.config.security.session_life * 1000;
	assert!((refreshed.expires - refreshed.issued - session_life).abs() < 100);

	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert_eq!(stored.session[&first.token].expires, refreshed.expires);
	assert_eq!(stored.session[&second.token].expires, second.expires);

	assert_eq!(events.recv().await.unwrap(), AuthEvent::Refresh {
		user_id: user.id.clone(),
		session: first.token.clone(),
	});
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_session_revokes_everywhere() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let first =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();
	let second =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();

	env.service.logout_session(&first.token).await.unwrap();

	assert!(
		env.session.fetch_token(&first.token).await.unwrap().is_none()
	);
	assert!(!env.server.key_names().contains(&first.token));

	let err = env
		.service
		.confirm_session(&first.token, &first.password)
		.await
		.unwrap_err();
	assert_eq!(err.key(), "unauthorized");

	// The other session is untouched
	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert!(stored.session.contains_key(&second.token));
	assert!(!stored.session.contains_key(&first.token));
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_others_preserves_current_session() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let current =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();
	let other =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();

	let mut events = env.events.subscribe();

	env.service.logout_others(&current.token).await.unwrap();

	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert!(stored.session.contains_key(&current.token));
	assert!(!stored.session.contains_key(&other.token));

	assert!(
		env.session.fetch_token(&other.token).await.unwrap().is_none()
	);

	assert_eq!(
		events.recv().await.unwrap(),
		AuthEvent::Logout { user_id: user.id.clone() }
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_user_clears_every_session() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let first =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();
	let second =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();

	let mut events = env.events.subscribe();

	env.service.logout_user(Some(&user.id), None).await.unwrap();

	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert!(stored.session.is_empty());

	for token in [&first.token, &second.token] {
		assert!(env.session.fetch_token(token).await.unwrap().is_none());
		assert!(!env.server.key_names().contains(token));
	}

	assert_eq!(
		events.recv().await.unwrap(),
		AuthEvent::Logout { user_id: user.id.clone() }
	);
	assert_eq!(
		events.recv().await.unwrap(),
		AuthEvent::LogoutAll { user_id: user.id.clone() }
	);
}

#[tokio::test(flavor = "multi_thread")]
async fn logout_user_by_session_id() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response =
		env.service.create_session(&user.id, "local", &req()).await.unwrap();

	env.service
		.logout_user(None, Some(&response.token))
		.await
		.unwrap();

	let stored = env.store.get(&user.id).await.unwrap().unwrap();
	assert!(stored.session.is_empty());

	let err = env.service.logout_user(None, None).await.unwrap_err();
	assert_eq!(err.key(), "unauthorized");
}

#[tokio::test(flavor = "multi_thread")]
async fn service_generated_api_keys_are_used_when_available() {
	let env = build_env_with_server(
		base_config(),
		MemoryServer::with_api_keys(),
	)
	.await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	let confirmed = env
		.service
		.confirm_session(&response.token, &response.password)
		.await
		.unwrap();
	assert_eq!(confirmed.id, user.id);
}

#[tokio::test(flavor = "multi_thread")]
async fn session_urls_embed_session_credentials() {
	let mut config = base_config();
	config.user_dbs.default_dbs.private = vec!["notes".to_string()];

	let env = build_env(config).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let response = env
		.service
		.create_session(&user.id, "local", &req())
		.await
		.unwrap();

	let url = &response.user_dbs["notes"];
	assert!(url.contains(&response.token));
	assert!(url.contains(&response.password));
	assert!(url.contains(&format!("userdb_notes${}", user.id)));
}

#[tokio::test(flavor = "multi_thread")]
async fn error_wire_shape() {
	let env = build_env(base_config()).await;

	let err =
		strategies::local(&env.service, "nobody@example.com", "x", &req())
			.await
			.unwrap_err();

	let wire = err.to_wire();
	assert_eq!(wire.error, "Unauthorized");
	assert_eq!(wire.key, "failed_login");
	assert_eq!(wire.status, 401);
	assert_eq!(wire.locked, None);

	let Error::Validation(_) = env
		.service
		.create(&serde_json::Map::new(), &req())
		.await
		.unwrap_err()
	else {
		panic!("expected validation error");
	};
}
