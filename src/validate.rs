//! Declarative, asynchronous document validation
//!
//! Schemas are data: a whitelist, per-field sanitizers and rules, cross-field
//! matches, post-validation renames, and static fields. Custom rules resolve
//! by name against an injected [`CustomValidator`] so uniqueness checks can
//! hit the document store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ValidationErrors};

/// A per-field value transform applied before validation
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Sanitizer {
	Trim,
	ToLowerCase,
}

impl Sanitizer {
	fn apply(self, value: &mut Value) {
		if let Value::String(s) = value {
			*s = match self {
				Self::Trim => s.trim().to_string(),
				Self::ToLowerCase => s.to_lowercase(),
			};
		}
	}
}

/// A single validation rule
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Rule {
	/// The field must be present and non-blank
	Presence,
	/// Minimum string length
	Length {
		minimum: usize,
		#[serde(default)]
		message: Option<String>,
	},
	/// The field must equal another field's value
	Matches(String),
	/// Delegate to a named asynchronous validator
	Custom(String),
}

/// Resolves named validators (`validateEmail`, `validatePhone`, ...)
#[async_trait]
pub trait CustomValidator: Send + Sync {
	/// Run the named validator; `Some(message)` marks a failure
	async fn validate(
		&self,
		name: &str,
		value: &str,
	) -> Result<Option<String>, Error>;
}

/// A declarative document schema
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Schema {
	/// Fields outside this list are dropped silently
	pub whitelist: Vec<String>,
	pub sanitize:  HashMap<String, Vec<Sanitizer>>,
	pub validate:  HashMap<String, Vec<Rule>>,
	/// Field renames applied after validation
	pub rename:    HashMap<String, String>,
	/// Fixed fields injected after validation
	#[serde(rename = "static")]
	pub statics:   Map<String, Value>,
}

impl Schema {
	/// Deep-merge an extension schema over a base schema
	///
	/// Whitelists union; per-field sanitizers, rules, and renames from the
	/// extension are appended; extension statics win on key collisions.
	#[must_use]
	pub fn merge(base: &Self, extension: &Self) -> Self {
		let mut merged = base.clone();

		for field in &extension.whitelist {
			if !merged.whitelist.contains(field) {
				merged.whitelist.push(field.clone());
			}
		}

		for (field, sanitizers) in &extension.sanitize {
			merged
				.sanitize
				.entry(field.clone())
				.or_default()
				.extend(sanitizers.iter().copied());
		}

		for (field, rules) in &extension.validate {
			merged
				.validate
				.entry(field.clone())
				.or_default()
				.extend(rules.iter().cloned());
		}

		for (from, to) in &extension.rename {
			merged.rename.insert(from.clone(), to.clone());
		}

		for (key, value) in &extension.statics {
			merged.statics.insert(key.clone(), value.clone());
		}

		merged
	}

	/// Validate and transform a document
	///
	/// # Errors
	/// Fails with [`Error::Validation`] carrying per-field messages
	pub async fn process(
		&self,
		input: &Map<String, Value>,
		custom: &dyn CustomValidator,
	) -> Result<Map<String, Value>, Error> {
		let mut doc = Map::new();

		// Whitelist: anything else is dropped silently
		for field in &self.whitelist {
			if let Some(value) = input.get(field) {
				doc.insert(field.clone(), value.clone());
			}
		}

		for (field, sanitizers) in &self.sanitize {
			if let Some(value) = doc.get_mut(field) {
				for sanitizer in sanitizers {
					sanitizer.apply(value);
				}
			}
		}

		let mut errors = ValidationErrors::new();

		for (field, rules) in &self.validate {
			for rule in rules {
				if let Some(message) =
					self.check(field, rule, &doc, custom).await?
				{
					errors.entry(field.clone()).or_default().push(message);
				}
			}
		}

		if !errors.is_empty() {
			return Err(Error::Validation(errors));
		}

		for (from, to) in &self.rename {
			if let Some(value) = doc.remove(from) {
				doc.insert(to.clone(), value);
			}
		}

		for (key, value) in &self.statics {
			doc.insert(key.clone(), value.clone());
		}

		Ok(doc)
	}

	async fn check(
		&self,
		field: &str,
		rule: &Rule,
		doc: &Map<String, Value>,
		custom: &dyn CustomValidator,
	) -> Result<Option<String>, Error> {
		let value = doc.get(field);
		let text = value.and_then(Value::as_str);

		match rule {
			Rule::Presence => {
				let blank = match value {
					None | Some(Value::Null) => true,
					Some(Value::String(s)) => s.trim().is_empty(),
					Some(_) => false,
				};

				if blank {
					return Ok(Some("can't be blank".to_string()));
				}
			},
			Rule::Length { minimum, message } => {
				if let Some(text) = text
					&& text.chars().count() < *minimum
				{
					return Ok(Some(message.clone().unwrap_or_else(|| {
						format!(
							"is too short (minimum is {minimum} characters)"
						)
					})));
				}
			},
			Rule::Matches(other) => {
				if value != doc.get(other) {
					return Ok(Some(format!("does not match {other}")));
				}
			},
			Rule::Custom(name) => {
				if let Some(text) = text {
					return custom.validate(name, text).await;
				}
			},
		}

		Ok(None)
	}
}
