mod common;

use common::{base_config, build_env};
use couchguard::error::Error;
use couchguard::validate::{Rule, Sanitizer, Schema};
use serde_json::{Map, Value, json};

fn form(pairs: &[(&str, Value)]) -> Map<String, Value> {
	pairs
		.iter()
		.map(|(key, value)| ((*key).to_string(), value.clone()))
		.collect()
}

fn sample_schema() -> Schema {
	let mut schema = Schema {
		whitelist: vec![
			"name".to_string(),
			"email".to_string(),
			"password".to_string(),
			"confirmPassword".to_string(),
		],
		..Schema::default()
	};

	schema
		.sanitize
		.insert("email".to_string(), vec![Sanitizer::Trim, Sanitizer::ToLowerCase]);
	schema
		.validate
		.insert("name".to_string(), vec![Rule::Presence, Rule::Length {
			minimum: 3,
			message: None,
		}]);
	schema.validate.insert("password".to_string(), vec![
		Rule::Presence,
		Rule::Matches("confirmPassword".to_string()),
	]);

	schema
}

#[tokio::test(flavor = "multi_thread")]
async fn whitelist_drops_unknown_fields_silently() {
	let env = build_env(base_config()).await;

	let input = form(&[
		("name", json!("bob")),
		("password", json!("x")),
		("confirmPassword", json!("x")),
		("isAdmin", json!(true)),
	]);

	let doc = sample_schema().process(&input, &env.service).await.unwrap();

	assert_eq!(doc.get("isAdmin"), None);
	assert_eq!(doc.get("name"), Some(&json!("bob")));
}

#[tokio::test(flavor = "multi_thread")]
async fn sanitizers_trim_and_lowercase() {
	let env = build_env(base_config()).await;

	let input = form(&[
		("name", json!("bob")),
		("email", json!("  Bob@Example.COM  ")),
		("password", json!("x")),
		("confirmPassword", json!("x")),
	]);

	let doc = sample_schema().process(&input, &env.service).await.unwrap();

	assert_eq!(doc.get("email"), Some(&json!("bob@example.com")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rules_collect_per_field_messages() {
	let env = build_env(base_config()).await;

	let input = form(&[
		("name", json!("ab")),
		("password", json!("x")),
		("confirmPassword", json!("y")),
	]);

	let err = sample_schema()
		.process(&input, &env.service)
		.await
		.unwrap_err();

	let Error::Validation(errors) = err else {
		panic!("expected validation errors");
	};

	assert_eq!(errors["name"], vec![
		"is too short (minimum is 3 characters)".to_string()
	]);
	assert_eq!(errors["password"], vec![
		"does not match confirmPassword".to_string()
	]);
}

#[tokio::test(flavor = "multi_thread")]
async fn presence_rejects_blank_and_missing_values() {
	let env = build_env(base_config()).await;

	let input = form(&[
		("name", json!("   ")),
		("password", json!("x")),
		("confirmPassword", json!("x")),
	]);

	let err = sample_schema()
		.process(&input, &env.service)
		.await
		.unwrap_err();

	let Error::Validation(errors) = err else {
		panic!("expected validation errors");
	};

	assert_eq!(errors["name"], vec!["can't be blank".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_and_statics_apply_after_validation() {
	let env = build_env(base_config()).await;

	let mut schema = sample_schema();
	schema.rename.insert("name".to_string(), "_id".to_string());
	schema.statics.insert("plan".to_string(), json!("free"));

	let input = form(&[
		("name", json!("bob")),
		("password", json!("x")),
		("confirmPassword", json!("x")),
	]);

	let doc = schema.process(&input, &env.service).await.unwrap();

	assert_eq!(doc.get("name"), None);
	assert_eq!(doc.get("_id"), Some(&json!("bob")));
	assert_eq!(doc.get("plan"), Some(&json!("free")));
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_email_validator_checks_format_and_uniqueness() {
	let env = build_env(base_config()).await;

	let mut schema = sample_schema();
	schema.validate.insert("email".to_string(), vec![Rule::Custom(
		"validateEmail".to_string(),
	)]);

	let input = form(&[
		("name", json!("bob")),
		("email", json!("not-an-email")),
		("password", json!("x")),
		("confirmPassword", json!("x")),
	]);

	let err = schema.process(&input, &env.service).await.unwrap_err();

	let Error::Validation(errors) = err else {
		panic!("expected validation errors");
	};

	assert_eq!(errors["email"], vec!["is not a valid email".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_unions_whitelists_and_extends_rules() {
	let base = sample_schema();

	let mut extension = Schema::default();
	extension.whitelist =
		vec!["name".to_string(), "nickname".to_string()];
	extension
		.validate
		.insert("nickname".to_string(), vec![Rule::Presence]);
	extension.statics.insert("plan".to_string(), json!("pro"));

	let merged = Schema::merge(&base, &extension);

	assert_eq!(merged.whitelist.iter().filter(|f| *f == "name").count(), 1);
	assert!(merged.whitelist.contains(&"nickname".to_string()));
	assert!(merged.validate.contains_key("nickname"));
	assert!(merged.validate.contains_key("password"));
	assert_eq!(merged.statics["plan"], json!("pro"));
}

#[tokio::test(flavor = "multi_thread")]
async fn user_model_extension_applies_on_create() {
	let mut config = base_config();

	let mut extension = Schema::default();
	extension.whitelist = vec!["nickname".to_string()];
	extension
		.sanitize
		.insert("nickname".to_string(), vec![Sanitizer::Trim]);
	extension.statics.insert("plan".to_string(), json!("free"));
	config.user_model = Some(extension);

	let env = build_env(config).await;

	let mut form = common::register_form("bob@example.com", "secret");
	form.insert("nickname".to_string(), json!("  bobby  "));
	form.insert("isAdmin".to_string(), json!(true));

	let user = env
		.service
		.create(&form, &common::req())
		.await
		.unwrap();

	assert_eq!(user.extra.get("nickname"), Some(&json!("bobby")));
	assert_eq!(user.extra.get("plan"), Some(&json!("free")));
	assert_eq!(user.extra.get("isAdmin"), None);
}
