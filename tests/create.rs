mod common;

use common::{base_config, build_env, register_form, req, wait_for_mail};
use couchguard::error::Error;
use couchguard::{AuthEvent, SessionStore};
use serde_json::json;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread")]
async fn create_with_uuid_as_id() {
	let mut config = base_config();
	config.local.uuid_as_id = true;

	let env = build_env(config).await;

	let user = env
		.service
		.create(&register_form("superuser@example2.com", "secret"), &req())
		.await
		.unwrap();

	assert_eq!(user.email.as_deref(), Some("superuser@example2.com"));
	assert_eq!(user.id.len(), 32);
	assert_eq!(user.username, None);
	assert_eq!(user.providers, vec!["local".to_string()]);
	assert!(user.local.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn create_with_username_rename() {
	let mut config = base_config();
	config.local.uuid_as_id = false;

	let env = build_env(config).await;

	let user = env
		.service
		.create(&register_form("superuser@example2.com", "secret"), &req())
		.await
		.unwrap();

	assert_eq!(user.id, "superuser@example2.com");
	assert_eq!(user.email.as_deref(), Some("superuser@example2.com"));
	assert_eq!(user.username, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_with_plain_username() {
	let env = build_env(base_config()).await;

	let user = env
		.service
		.create(&register_form("bob", "secret"), &req())
		.await
		.unwrap();

	assert_eq!(user.id, "bob");
	assert_eq!(user.username.as_deref(), Some("bob"));
	assert_eq!(user.email, None);

	let found = env.service.get("bob").await.unwrap().unwrap();
	assert_eq!(found.id, "bob");
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_invalid_username_characters() {
	let env = build_env(base_config()).await;

	let err = env
		.service
		.create(&register_form("bad name!", "secret"), &req())
		.await
		.unwrap_err();

	let Error::Validation(errors) = &err else {
		panic!("expected a validation error, got {err:?}");
	};

	assert!(errors.contains_key("username"));
}

#[tokio::test(flavor = "multi_thread")]
async fn create_invite_gated() {
	let mut config = base_config();
	config.security.invite_only_registration = true;

	let env = build_env(config).await;

	let uid = Uuid::new_v4().simple().to_string();
	env.session
		.store_key("invite_code:sesame", 10000, &uid)
		.await
		.unwrap();

	let mut form = register_form("invited@example.com", "secret");
	form.insert("inviteCode".to_string(), json!("sesame"));

	let user = env.service.create(&form, &req()).await.unwrap();

	assert_eq!(user.id, uid);

	// The invite key is consumed
	let stored = env.session.get_key("invite_code:sesame").await.unwrap();
	assert_eq!(stored, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_missing_invite_code() {
	let mut config = base_config();
	config.security.invite_only_registration = true;

	let env = build_env(config).await;

	let mut form = register_form("invited@example.com", "secret");
	form.insert("inviteCode".to_string(), json!("wrong"));

	let err = env.service.create(&form, &req()).await.unwrap_err();

	assert_eq!(err.key(), "missing_invite_code");
	assert_eq!(err.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_validation_does_not_consume_invite() {
	let mut config = base_config();
	config.security.invite_only_registration = true;

	let env = build_env(config).await;

	env.session
		.store_key("invite_code:sesame", 10000, "anything")
		.await
		.unwrap();

	let mut form = register_form("invited@example.com", "secret");
	form.insert("confirmPassword".to_string(), json!("different"));
	form.insert("inviteCode".to_string(), json!("sesame"));

	let err = env.service.create(&form, &req()).await.unwrap_err();
	assert_eq!(err.key(), "validation_failed");

	let stored = env.session.get_key("invite_code:sesame").await.unwrap();
	assert_eq!(stored.as_deref(), Some("anything"));
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_password_mismatch() {
	let env = build_env(base_config()).await;

	let mut form = register_form("bob@example.com", "secret");
	form.insert("confirmPassword".to_string(), json!("other"));

	let err = env.service.create(&form, &req()).await.unwrap_err();

	let Error::Validation(errors) = &err else {
		panic!("expected a validation error, got {err:?}");
	};

	assert!(errors.contains_key("password"));
	assert_eq!(err.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_rejects_duplicate_email() {
	let env = build_env(base_config()).await;

	env.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let err = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap_err();

	let Error::Validation(errors) = &err else {
		panic!("expected a validation error, got {err:?}");
	};

	assert_eq!(errors["email"], vec!["already in use".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_parks_unverified_email_and_mails_token() {
	let mut config = base_config();
	config.local.send_confirm_email = true;

	let env = build_env(config).await;

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	assert_eq!(user.email, None);

	let unverified = user.unverified_email.as_ref().unwrap();
	assert_eq!(unverified.email, "bob@example.com");
	assert!(!unverified.token.is_empty());

	wait_for_mail(&env.mailbox, 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn create_records_signup_and_activity() {
	let env = build_env(base_config()).await;
	let mut events = env.events.subscribe();

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let sign_up = user.sign_up.as_ref().unwrap();
	assert_eq!(sign_up.provider, "local");
	assert_eq!(sign_up.ip.as_deref(), Some("127.0.0.1"));

	assert_eq!(user.activity[0].action, "signup");
	assert_eq!(user.activity[0].provider, "local");

	assert_eq!(events.recv().await.unwrap(), AuthEvent::Signup {
		user_id:  user.id.clone(),
		provider: "local".to_string(),
	});
}

#[tokio::test(flavor = "multi_thread")]
async fn create_transformations_run_sequentially() {
	let mut env = build_env(base_config()).await;

	// The first transformation finishes across an await point before the
	// second one observes its result
	env.service.add_on_create(Box::new(|mut user, _provider| {
		Box::pin(async move {
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			user.extra.insert("first".to_string(), json!("done"));

			Ok(user)
		})
	}));
	env.service.add_on_create(Box::new(|mut user, _provider| {
		Box::pin(async move {
			let seen = user.extra.get("first").cloned().unwrap_or(json!(null));
			user.extra.insert("second".to_string(), seen);

			Ok(user)
		})
	}));

	let user = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	assert_eq!(user.extra.get("second"), Some(&json!("done")));
}

#[tokio::test(flavor = "multi_thread")]
async fn create_then_get_by_every_login_key() {
	let env = build_env(base_config()).await;

	let created = env
		.service
		.create(&register_form("bob@example.com", "secret"), &req())
		.await
		.unwrap();

	let by_email = env.service.get("bob@example.com").await.unwrap().unwrap();

	assert_eq!(by_email.id, created.id);
}
