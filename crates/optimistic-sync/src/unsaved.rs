use crate::record::Record;

/// Tells whether the edited copy of a record drifted from the value the edit started from.
///
/// The modification instant is left out of the comparison, an update racing in from elsewhere
/// only bumps it and is not an edit.
#[derive(Debug, Clone, Default)]
pub struct UnsavedChanges {
	baseline: Option<Record>,
	live: Option<Record>,
	dirty: bool,
}

impl UnsavedChanges {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Feed the latest edited copy, the first one observed becomes the baseline
	pub fn observe(&mut self, live: &Record) -> bool {
		self.dirty = match &self.baseline {
			None => {
				self.baseline = Some(live.clone());
				false
			}
			Some(baseline) => !baseline.same_content(live),
		};

		self.live = Some(live.clone());
		self.dirty
	}

	#[must_use]
	pub const fn has_unsaved_changes(&self) -> bool {
		self.dirty
	}

	#[must_use]
	pub const fn baseline(&self) -> Option<&Record> {
		self.baseline.as_ref()
	}

	/// Take the last observed copy as the new baseline, after an explicit save
	pub fn reset(&mut self) {
		if let Some(live) = &self.live {
			self.baseline = Some(live.clone());
		}

		self.dirty = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::record::{OwnerId, Stage};

	use chrono::{Duration, Utc};
	use serde_json::{json, Map};

	fn record(title: &str) -> Record {
		let mut fields = Map::new();
		fields.insert("title".to_string(), json!(title));
		fields.insert("tags".to_string(), json!({ "area": ["infra"] }));

		Record {
			id: "r-1".into(),
			owner_id: OwnerId::from("user-1"),
			stage: Stage::Considering,
			created_at: "2024-05-01T10:00:00Z".parse().unwrap(),
			updated_at: Some(Utc::now()),
			fields,
		}
	}

	#[test]
	fn modification_instant_is_ignored() {
		let mut unsaved = UnsavedChanges::new();
		let baseline = record("X");
		unsaved.observe(&baseline);

		let mut live = baseline.clone();
		live.updated_at = baseline.updated_at.map(|at| at + Duration::seconds(5));

		assert!(!unsaved.observe(&live));
		assert!(!unsaved.has_unsaved_changes());
	}

	#[test]
	fn nested_field_edits_are_detected() {
		let mut unsaved = UnsavedChanges::new();
		let mut live = record("X");
		unsaved.observe(&live);

		live.fields
			.get_mut("tags")
			.and_then(|tags| tags["area"].as_array_mut())
			.unwrap()
			.push(json!("ux"));

		assert!(unsaved.observe(&live));
		assert_eq!(
			unsaved.baseline().unwrap().fields["tags"]["area"],
			json!(["infra"]),
			"baseline is a deep copy"
		);
	}

	#[test]
	fn reset_takes_the_live_copy_as_baseline() {
		let mut unsaved = UnsavedChanges::new();
		unsaved.observe(&record("X"));
		assert!(unsaved.observe(&record("Y")));

		unsaved.reset();
		assert!(!unsaved.has_unsaved_changes());
		assert!(!unsaved.observe(&record("Y")));
		assert!(unsaved.observe(&record("X")));
	}
}
