//! Typed entity model and record validation.
//!
//! Raw payloads are schema-on-read JSON objects. Conformance parses each one
//! into an [`EntityRecord`] variant for its entity type, enforcing the
//! validation rules below; nothing downstream touches untyped fields.
//!
//! | Rule | Violation |
//! |------|-----------|
//! | natural key missing or empty | `missing_natural_key` |
//! | encounter without `patient_id` | `missing_field` |
//! | known field has wrong JSON type / unparsable value | `wrong_type` |
//! | `age` outside `0..=max_plausible_age` | `implausible_age` |
//! | timestamp after ingestion time + clock skew | `future_timestamp` |
//! | `discharge_time` before `admission_time` | `discharge_before_admission` |
//! | negative cost or coverage | `negative_amount` |
//!
//! Every attribute is optional: a record carries only the fields it knows,
//! and [`EntityRecord::overlay`] merges provided fields without clearing the
//! others.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use strata_core::partition::PartitionKey;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, ViolationKind};

/// The fixed set of conformed entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Encounter facts.
    Encounter,
    /// Patient dimension.
    Patient,
    /// Payer dimension.
    Payer,
    /// Organization dimension.
    Organization,
}

impl EntityType {
    /// All entity types in processing order.
    pub const ALL: [Self; 4] = [Self::Encounter, Self::Patient, Self::Payer, Self::Organization];

    /// Stable lowercase name, used in storage paths.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Encounter => "encounter",
            Self::Patient => "patient",
            Self::Payer => "payer",
            Self::Organization => "organization",
        }
    }

    /// Raw source that feeds this entity type unless configured otherwise.
    #[must_use]
    pub const fn default_source(self) -> &'static str {
        match self {
            Self::Encounter => "encounters",
            Self::Patient => "patients",
            Self::Payer => "payers",
            Self::Organization => "organizations",
        }
    }

    /// Returns true for slowly-changing dimension entities.
    #[must_use]
    pub const fn is_dimension(self) -> bool {
        !matches!(self, Self::Encounter)
    }

    /// Payload fields accepted as the natural key.
    #[must_use]
    pub const fn natural_key_fields(self) -> &'static [&'static str] {
        match self {
            Self::Encounter => &["encounter_id", "Id"],
            Self::Patient => &["patient_id", "Id"],
            Self::Payer => &["payer_id", "Id"],
            Self::Organization => &["organization_id", "Id"],
        }
    }

    /// Attribute columns exposed by admin views, in display order.
    #[must_use]
    pub const fn attribute_columns(self) -> &'static [&'static str] {
        match self {
            Self::Encounter => &[
                "patient_id",
                "gender",
                "age",
                "department",
                "admission_time",
                "discharge_time",
                "organization_id",
                "provider_id",
                "payer_id",
                "base_encounter_cost",
                "total_claim_cost",
                "payer_coverage",
            ],
            Self::Patient => &[
                "birthdate",
                "gender",
                "race",
                "ethnicity",
                "city",
                "state",
                "zip",
            ],
            Self::Payer => &["name"],
            Self::Organization => &["name", "city", "state"],
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| PipelineError::Config {
                message: format!(
                    "unknown entity type '{s}': expected one of encounter, patient, payer, organization"
                ),
            })
    }
}

/// Encounter fact attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncounterAttributes {
    /// Patient seen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    /// Patient gender at the time of the encounter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Patient age in years.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
    /// Encounter class (department).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    /// Admission timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admission_time: Option<DateTime<Utc>>,
    /// Discharge timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discharge_time: Option<DateTime<Utc>>,
    /// Treating organization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    /// Treating provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Payer billed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_id: Option<String>,
    /// Base cost of the encounter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_encounter_cost: Option<f64>,
    /// Total claim cost.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_claim_cost: Option<f64>,
    /// Amount covered by the payer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer_coverage: Option<f64>,
}

/// Patient dimension attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientAttributes {
    /// Date of birth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birthdate: Option<NaiveDate>,
    /// Recorded gender.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    /// Recorded race.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub race: Option<String>,
    /// Recorded ethnicity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ethnicity: Option<String>,
    /// City of residence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// State of residence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Postal code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
}

/// Payer dimension attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayerAttributes {
    /// Payer display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Organization dimension attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationAttributes {
    /// Organization display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// City the organization is in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// State the organization is in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

macro_rules! overlay_fields {
    ($target:expr, $incoming:expr, $($field:ident),+ $(,)?) => {
        $(
            if $incoming.$field.is_some() {
                $target.$field.clone_from(&$incoming.$field);
            }
        )+
    };
}

/// Typed attributes of one entity, tagged by entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum EntityRecord {
    /// Encounter fact.
    Encounter(EncounterAttributes),
    /// Patient dimension row.
    Patient(PatientAttributes),
    /// Payer dimension row.
    Payer(PayerAttributes),
    /// Organization dimension row.
    Organization(OrganizationAttributes),
}

impl EntityRecord {
    /// Returns the entity type of this record.
    #[must_use]
    pub const fn entity_type(&self) -> EntityType {
        match self {
            Self::Encounter(_) => EntityType::Encounter,
            Self::Patient(_) => EntityType::Patient,
            Self::Payer(_) => EntityType::Payer,
            Self::Organization(_) => EntityType::Organization,
        }
    }

    /// Overwrites the fields `incoming` provides, leaving the rest untouched.
    ///
    /// Returns true if any field changed.
    pub fn overlay(&mut self, incoming: &Self) -> bool {
        let before = self.clone();
        match (&mut *self, incoming) {
            (Self::Encounter(t), Self::Encounter(i)) => {
                overlay_fields!(
                    t,
                    i,
                    patient_id,
                    gender,
                    age,
                    department,
                    admission_time,
                    discharge_time,
                    organization_id,
                    provider_id,
                    payer_id,
                    base_encounter_cost,
                    total_claim_cost,
                    payer_coverage,
                );
            }
            (Self::Patient(t), Self::Patient(i)) => {
                overlay_fields!(t, i, birthdate, gender, race, ethnicity, city, state, zip);
            }
            (Self::Payer(t), Self::Payer(i)) => {
                overlay_fields!(t, i, name);
            }
            (Self::Organization(t), Self::Organization(i)) => {
                overlay_fields!(t, i, name, city, state);
            }
            (target, incoming) => *target = incoming.clone(),
        }
        *self != before
    }

    /// Conformed-tier partition for this record.
    ///
    /// Encounters are partitioned by admission month, falling back to the
    /// event time; dimensions live in a single partition.
    #[must_use]
    pub fn partition(&self, event_time: DateTime<Utc>) -> PartitionKey {
        match self {
            Self::Encounter(e) => PartitionKey::monthly(e.admission_time.unwrap_or(event_time)),
            _ => PartitionKey::unpartitioned(),
        }
    }

    /// Attribute values keyed by column name, for views and inspection.
    #[must_use]
    pub fn columns(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("entity_type");
                map
            }
            _ => Map::new(),
        }
    }

    /// Returns the encounter attributes, if this is an encounter.
    #[must_use]
    pub const fn as_encounter(&self) -> Option<&EncounterAttributes> {
        match self {
            Self::Encounter(e) => Some(e),
            _ => None,
        }
    }

    /// Display name for payer and organization rows.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Payer(p) => p.name.as_deref(),
            Self::Organization(o) => o.name.as_deref(),
            _ => None,
        }
    }
}

/// Validation thresholds derived from the pipeline configuration.
#[derive(Debug, Clone, Copy)]
pub struct ValidationRules {
    /// Largest plausible age in years.
    pub max_age: u32,
    /// Allowed lead of record timestamps over ingestion time.
    pub clock_skew: chrono::Duration,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ValidationRules {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_age: config.max_plausible_age,
            clock_skew: config.skew(),
        }
    }
}

/// A validated record ready for upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    /// Natural key within the entity type.
    pub natural_key: String,
    /// Typed attributes.
    pub record: EntityRecord,
    /// Event time used for ordering.
    pub event_time: DateTime<Utc>,
    /// Ingestion time, the ordering tie-break.
    pub ingested_at: DateTime<Utc>,
}

impl ParsedRecord {
    /// Ordering key: event time, then ingestion time.
    #[must_use]
    pub fn order_key(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.event_time, self.ingested_at)
    }
}

/// Inputs that are not part of the payload itself.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
    /// When the raw record landed.
    pub ingested_at: DateTime<Utc>,
    /// Payload field carrying the event time, if the record has one.
    pub event_time_field: Option<&'a str>,
    /// Validation thresholds.
    pub rules: ValidationRules,
}

/// Parses and validates a payload as `entity_type`.
///
/// # Errors
///
/// Returns `PipelineError::SchemaViolation` describing the first rule the
/// payload breaks.
pub fn parse_record(
    entity_type: EntityType,
    payload: &Map<String, Value>,
    ctx: &RecordContext<'_>,
) -> Result<ParsedRecord> {
    let fields = Fields(payload);
    let natural_key = fields
        .string(entity_type.natural_key_fields())?
        .ok_or_else(|| {
            PipelineError::violation(
                ViolationKind::MissingNaturalKey,
                format!(
                    "{entity_type} record has no {}",
                    entity_type.natural_key_fields().join("/")
                ),
            )
        })?;

    let latest_allowed = ctx.ingested_at + ctx.rules.clock_skew;
    let event_time = match ctx.event_time_field.and_then(|f| fields.raw(&[f])) {
        Some(Value::String(s)) => parse_timestamp(s),
        _ => None,
    };
    if let Some(ts) = event_time {
        ensure_not_future("event_time", ts, latest_allowed)?;
    }

    let record = match entity_type {
        EntityType::Encounter => EntityRecord::Encounter(parse_encounter(&fields, ctx, latest_allowed)?),
        EntityType::Patient => {
            let birthdate = fields.date(&["birthdate"])?;
            if let Some(date) = birthdate {
                if date > latest_allowed.date_naive() {
                    return Err(PipelineError::violation(
                        ViolationKind::FutureTimestamp,
                        format!("birthdate {date} is in the future"),
                    ));
                }
            }
            EntityRecord::Patient(PatientAttributes {
                birthdate,
                gender: fields.string(&["gender"])?,
                race: fields.string(&["race"])?,
                ethnicity: fields.string(&["ethnicity"])?,
                city: fields.string(&["city"])?,
                state: fields.string(&["state"])?,
                zip: fields.string(&["zip"])?,
            })
        }
        EntityType::Payer => EntityRecord::Payer(PayerAttributes {
            name: fields.string(&["name"])?,
        }),
        EntityType::Organization => EntityRecord::Organization(OrganizationAttributes {
            name: fields.string(&["name"])?,
            city: fields.string(&["city"])?,
            state: fields.string(&["state"])?,
        }),
    };

    Ok(ParsedRecord {
        natural_key,
        record,
        event_time: event_time.unwrap_or(ctx.ingested_at),
        ingested_at: ctx.ingested_at,
    })
}

fn parse_encounter(
    fields: &Fields<'_>,
    ctx: &RecordContext<'_>,
    latest_allowed: DateTime<Utc>,
) -> Result<EncounterAttributes> {
    let patient_id = fields.string(&["patient_id", "PATIENT"])?.ok_or_else(|| {
        PipelineError::violation(ViolationKind::MissingField, "encounter has no patient_id")
    })?;

    let age = match fields.integer(&["age"])? {
        Some(age) if (0..=i64::from(ctx.rules.max_age)).contains(&age) => u32::try_from(age).ok(),
        Some(age) => {
            return Err(PipelineError::violation(
                ViolationKind::ImplausibleAge,
                format!("age {age} outside 0..={}", ctx.rules.max_age),
            ))
        }
        None => None,
    };

    let admission_time = fields.timestamp(&["admission_time", "START"])?;
    let discharge_time = fields.timestamp(&["discharge_time", "STOP"])?;
    if let Some(admitted) = admission_time {
        ensure_not_future("admission_time", admitted, latest_allowed)?;
        if let Some(discharged) = discharge_time {
            if discharged < admitted {
                return Err(PipelineError::violation(
                    ViolationKind::DischargeBeforeAdmission,
                    format!("discharge {discharged} before admission {admitted}"),
                ));
            }
        }
    }

    Ok(EncounterAttributes {
        patient_id: Some(patient_id),
        gender: fields.string(&["gender"])?,
        age,
        department: fields.string(&["department", "ENCOUNTERCLASS"])?,
        admission_time,
        discharge_time,
        organization_id: fields.string(&["organization_id", "ORGANIZATION"])?,
        provider_id: fields.string(&["provider_id", "PROVIDER"])?,
        payer_id: fields.string(&["payer_id", "PAYER"])?,
        base_encounter_cost: fields.amount(&["base_encounter_cost"])?,
        total_claim_cost: fields.amount(&["total_claim_cost"])?,
        payer_coverage: fields.amount(&["payer_coverage"])?,
    })
}

fn ensure_not_future(field: &str, ts: DateTime<Utc>, latest_allowed: DateTime<Utc>) -> Result<()> {
    if ts > latest_allowed {
        return Err(PipelineError::violation(
            ViolationKind::FutureTimestamp,
            format!("{field} {ts} is after ingestion time plus skew tolerance"),
        ));
    }
    Ok(())
}

/// Parses a timestamp in RFC 3339 or `YYYY-MM-DDTHH:MM:SSZ` form.
///
/// Also accepts an offset followed by a stray `Z` and naive
/// `YYYY-MM-DD HH:MM:SS` (treated as UTC).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Some(ts) = s
        .strip_suffix('Z')
        .and_then(|rest| DateTime::parse_from_rfc3339(rest).ok())
    {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
        .into_iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Parses a calendar date as `YYYY-MM-DD`, `M/D/YYYY`, or a full timestamp.
#[must_use]
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    ["%Y-%m-%d", "%m/%d/%Y"]
        .into_iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| parse_timestamp(s).map(|ts| ts.date_naive()))
}

/// Field access over a payload with alias and upper-case column fallback.
struct Fields<'a>(&'a Map<String, Value>);

impl<'a> Fields<'a> {
    /// First non-null, non-blank value among the aliases.
    fn raw(&self, aliases: &[&str]) -> Option<&'a Value> {
        aliases
            .iter()
            .flat_map(|alias| [(*alias).to_string(), alias.to_ascii_uppercase()])
            .filter_map(|name| self.0.get(&name))
            .find(|v| match v {
                Value::Null => false,
                Value::String(s) => !s.trim().is_empty(),
                _ => true,
            })
    }

    fn string(&self, aliases: &[&str]) -> Result<Option<String>> {
        match self.raw(aliases) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => Err(wrong_type(aliases[0], "a string", other)),
        }
    }

    fn integer(&self, aliases: &[&str]) -> Result<Option<i64>> {
        match self.raw(aliases) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 1e15)
                        .map(|f| f as i64)
                })
                .map(Some)
                .ok_or_else(|| wrong_type(aliases[0], "an integer", &Value::Number(n.clone()))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| wrong_type(aliases[0], "an integer", &Value::String(s.clone()))),
            Some(other) => Err(wrong_type(aliases[0], "an integer", other)),
        }
    }

    /// Non-negative monetary amount.
    fn amount(&self, aliases: &[&str]) -> Result<Option<f64>> {
        let value = match self.raw(aliases) {
            None => return Ok(None),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(other) => return Err(wrong_type(aliases[0], "a number", other)),
        };
        match value {
            Some(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
            Some(v) if v.is_finite() => Err(PipelineError::violation(
                ViolationKind::NegativeAmount,
                format!("{} is negative: {v}", aliases[0]),
            )),
            _ => Err(PipelineError::violation(
                ViolationKind::WrongType,
                format!("{} is not a finite number", aliases[0]),
            )),
        }
    }

    fn timestamp(&self, aliases: &[&str]) -> Result<Option<DateTime<Utc>>> {
        match self.raw(aliases) {
            None => Ok(None),
            Some(Value::String(s)) => parse_timestamp(s)
                .map(Some)
                .ok_or_else(|| wrong_type(aliases[0], "a timestamp", &Value::String(s.clone()))),
            Some(other) => Err(wrong_type(aliases[0], "a timestamp", other)),
        }
    }

    fn date(&self, aliases: &[&str]) -> Result<Option<NaiveDate>> {
        match self.raw(aliases) {
            None => Ok(None),
            Some(Value::String(s)) => parse_date(s)
                .map(Some)
                .ok_or_else(|| wrong_type(aliases[0], "a date", &Value::String(s.clone()))),
            Some(other) => Err(wrong_type(aliases[0], "a date", other)),
        }
    }
}

fn wrong_type(field: &str, expected: &str, got: &Value) -> PipelineError {
    PipelineError::violation(
        ViolationKind::WrongType,
        format!("{field} must be {expected}, got {got}"),
    )
}
