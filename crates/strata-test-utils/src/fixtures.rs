//! Pre-built test fixtures for common test scenarios.
//!
//! Builders produce source payloads (JSON objects) and reference rows with
//! sensible defaults so tests only spell out the fields they care about.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

/// One reference row, keyed by column name.
pub type Row = BTreeMap<String, String>;

/// Parses an RFC 3339 timestamp.
///
/// # Panics
///
/// Panics on malformed input.
#[must_use]
pub fn ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid RFC 3339 timestamp")
        .with_timezone(&Utc)
}

/// Builder for encounter event payloads.
#[derive(Debug, Clone)]
pub struct EncounterBuilder {
    fields: Map<String, Value>,
}

impl EncounterBuilder {
    /// An ambulatory, one-hour encounter admitted on 2025-01-10.
    pub fn new(encounter_id: &str, patient_id: &str) -> Self {
        let admitted = ts("2025-01-10T08:00:00Z");
        let mut fields = Map::new();
        fields.insert("encounter_id".into(), json!(encounter_id));
        fields.insert("patient_id".into(), json!(patient_id));
        fields.insert("department".into(), json!("ambulatory"));
        fields.insert("organization_id".into(), json!("O1"));
        fields.insert("payer_id".into(), json!("Y1"));
        fields.insert("total_claim_cost".into(), json!(100.0));
        fields.insert("payer_coverage".into(), json!(80.0));
        let mut builder = Self { fields };
        builder = builder.admitted(admitted);
        builder.discharged(admitted + Duration::hours(1))
    }

    /// Sets the department.
    #[must_use]
    pub fn department(self, department: &str) -> Self {
        self.field("department", json!(department))
    }

    /// Sets the admission time.
    #[must_use]
    pub fn admitted(self, at: DateTime<Utc>) -> Self {
        self.field("admission_time", json!(at.to_rfc3339()))
    }

    /// Sets the discharge time.
    #[must_use]
    pub fn discharged(self, at: DateTime<Utc>) -> Self {
        self.field("discharge_time", json!(at.to_rfc3339()))
    }

    /// Sets the organization.
    #[must_use]
    pub fn organization(self, organization_id: &str) -> Self {
        self.field("organization_id", json!(organization_id))
    }

    /// Sets the payer.
    #[must_use]
    pub fn payer(self, payer_id: &str) -> Self {
        self.field("payer_id", json!(payer_id))
    }

    /// Sets claim cost and payer coverage.
    #[must_use]
    pub fn costs(self, total_claim_cost: f64, payer_coverage: f64) -> Self {
        self.field("total_claim_cost", json!(total_claim_cost))
            .field("payer_coverage", json!(payer_coverage))
    }

    /// Sets the event-time field used for ordering.
    #[must_use]
    pub fn event_time(self, at: DateTime<Utc>) -> Self {
        self.field("event_time", json!(at.to_rfc3339()))
    }

    /// Sets or replaces an arbitrary field.
    #[must_use]
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Drops a field, producing a partial record.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    /// Builds the payload.
    #[must_use]
    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }
}

/// A payer reference row.
#[must_use]
pub fn payer_row(id: &str, name: &str) -> Row {
    row(&[("Id", id), ("NAME", name)])
}

/// An organization reference row.
#[must_use]
pub fn organization_row(id: &str, name: &str, city: &str, state: &str) -> Row {
    row(&[("Id", id), ("NAME", name), ("CITY", city), ("STATE", state)])
}

/// A patient reference row.
#[must_use]
pub fn patient_row(id: &str, birthdate: &str, gender: &str) -> Row {
    row(&[("Id", id), ("BIRTHDATE", birthdate), ("GENDER", gender)])
}

/// Builds a reference row from column/value pairs.
#[must_use]
pub fn row(pairs: &[(&str, &str)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

/// Ten encounters over two months, three departments and two payers.
#[must_use]
pub fn encounter_history() -> Vec<Value> {
    let departments = ["ambulatory", "emergency", "inpatient"];
    (0..10u32)
        .map(|i| {
            let admitted = if i < 6 {
                ts("2025-01-05T09:00:00Z") + Duration::days(i64::from(i))
            } else {
                ts("2025-02-03T09:00:00Z") + Duration::days(i64::from(i))
            };
            EncounterBuilder::new(&format!("E{i}"), &format!("P{}", i % 4))
                .department(departments[(i % 3) as usize])
                .payer(if i % 2 == 0 { "Y1" } else { "Y2" })
                .organization(if i % 5 == 0 { "O2" } else { "O1" })
                .admitted(admitted)
                .discharged(admitted + Duration::hours(i64::from(i % 4) + 1))
                .costs(100.0 + f64::from(i) * 10.0, 50.0 + f64::from(i) * 5.0)
                .build()
        })
        .collect()
}
