//! Free-text sanitization and validation, applied by the mutation gateway before any write

use crate::{
	config::{TextFieldRule, ValidationConfig},
	error::ValidationError,
	record::{NewRecord, Record},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::trace;

static EXECUTABLE_BLOCKS: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
		.expect("executable block pattern is valid")
});

static MARKUP_TAGS: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?s)</?[a-zA-Z!][^>]*>").expect("markup tag pattern is valid"));

static SCRIPT_SCHEMES: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"(?i)(?:java|vb)script\s*:").expect("script scheme pattern is valid")
});

static INLINE_HANDLERS: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r#"(?i)\bon[a-z]+\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("inline handler pattern is valid")
});

#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
	rules: Vec<TextFieldRule>,
}

impl Sanitizer {
	#[must_use]
	pub fn new(config: &ValidationConfig) -> Self {
		Self {
			rules: config.text_fields.clone(),
		}
	}

	/// Strip executable and markup content from a piece of text
	#[must_use]
	pub fn clean(text: &str) -> String {
		let text = EXECUTABLE_BLOCKS.replace_all(text, "");
		let text = MARKUP_TAGS.replace_all(&text, "");
		let text = SCRIPT_SCHEMES.replace_all(&text, "");
		let text = INLINE_HANDLERS.replace_all(&text, "");

		text.trim().to_string()
	}

	pub fn check_new(&self, mut payload: NewRecord) -> Result<NewRecord, ValidationError> {
		self.check_fields(&mut payload.fields)?;
		Ok(payload)
	}

	pub fn check_record(&self, mut record: Record) -> Result<Record, ValidationError> {
		self.check_fields(&mut record.fields)?;
		Ok(record)
	}

	/// Sanitize every ruled field in place, fields without a rule pass through untouched
	pub fn check_fields(&self, fields: &mut Map<String, Value>) -> Result<(), ValidationError> {
		for rule in &self.rules {
			let text = match fields.get(&rule.field) {
				None | Some(Value::Null) => {
					if rule.required {
						return Err(ValidationError::Required {
							field: rule.field.clone(),
						});
					}
					continue;
				}
				Some(Value::String(text)) => text,
				Some(_) => {
					return Err(ValidationError::NotText {
						field: rule.field.clone(),
					})
				}
			};

			let cleaned = check_text(rule, text)?;
			if &cleaned != text {
				trace!(field = %rule.field, "Sanitized text field");
			}

			fields.insert(rule.field.clone(), Value::String(cleaned));
		}

		Ok(())
	}
}

fn check_text(rule: &TextFieldRule, text: &str) -> Result<String, ValidationError> {
	let cleaned = Sanitizer::clean(text);
	let len = cleaned.chars().count();

	if len == 0 {
		if rule.required {
			return Err(ValidationError::Required {
				field: rule.field.clone(),
			});
		}

		return Ok(cleaned);
	}

	if len < rule.min_len {
		return Err(ValidationError::TooShort {
			field: rule.field.clone(),
			min: rule.min_len,
			actual: len,
		});
	}

	if len > rule.max_len {
		if !rule.truncate {
			return Err(ValidationError::TooLong {
				field: rule.field.clone(),
				max: rule.max_len,
				actual: len,
			});
		}

		return Ok(cleaned
			.chars()
			.take(rule.max_len)
			.collect::<String>()
			.trim_end()
			.to_string());
	}

	Ok(cleaned)
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::record::{OwnerId, Stage};

	use serde_json::json;

	fn sanitizer() -> Sanitizer {
		Sanitizer::new(&ValidationConfig::default())
	}

	#[test]
	fn strips_executable_content() {
		assert_eq!(
			Sanitizer::clean("  Ship <b>v2</b><script>alert('x')</script> "),
			"Ship v2"
		);
		assert_eq!(
			Sanitizer::clean(r#"<a href="javascript:run()" onclick="x()">link</a>"#),
			"link"
		);
		assert_eq!(Sanitizer::clean("javascript:alert(1)"), "alert(1)");
		assert_eq!(Sanitizer::clean(r#"x onerror='boom()' y"#), "x  y");
		assert_eq!(Sanitizer::clean("one = two"), "one = two");
		assert_eq!(Sanitizer::clean("a < b and c > d"), "a < b and c > d");
	}

	#[test]
	fn rejects_missing_or_empty_title() {
		let payload = NewRecord::new(OwnerId::from("user-1"), Stage::Backlog);
		assert_eq!(
			sanitizer().check_new(payload).unwrap_err(),
			ValidationError::Required {
				field: "title".to_string()
			}
		);

		let payload = NewRecord::new(OwnerId::from("user-1"), Stage::Backlog)
			.with_field("title", "<p> </p>");
		assert!(matches!(
			sanitizer().check_new(payload),
			Err(ValidationError::Required { .. })
		));
	}

	#[test]
	fn rejects_long_title_but_truncates_description() {
		let payload = NewRecord::new(OwnerId::from("user-1"), Stage::Backlog)
			.with_field("title", "é".repeat(201));
		assert_eq!(
			sanitizer().check_new(payload).unwrap_err(),
			ValidationError::TooLong {
				field: "title".to_string(),
				max: 200,
				actual: 201,
			}
		);

		let payload = NewRecord::new(OwnerId::from("user-1"), Stage::Backlog)
			.with_field("title", "é".repeat(200))
			.with_field("description", "x".repeat(6_000));
		let checked = sanitizer().check_new(payload).unwrap();
		assert_eq!(
			checked.fields["description"].as_str().unwrap().chars().count(),
			5_000
		);
	}

	#[test]
	fn enforces_minimum_length() {
		let sanitizer = Sanitizer::new(&ValidationConfig {
			text_fields: vec![TextFieldRule {
				field: "title".to_string(),
				required: true,
				min_len: 3,
				max_len: 10,
				truncate: false,
			}],
		});

		let mut fields = Map::new();
		fields.insert("title".to_string(), json!("ab"));
		assert!(matches!(
			sanitizer.check_fields(&mut fields),
			Err(ValidationError::TooShort {
				min: 3,
				actual: 2,
				..
			})
		));
	}

	#[test]
	fn non_text_values_are_rejected() {
		let mut fields = Map::new();
		fields.insert("title".to_string(), json!(42));

		assert_eq!(
			sanitizer().check_fields(&mut fields).unwrap_err(),
			ValidationError::NotText {
				field: "title".to_string()
			}
		);
	}
}
