//! Mart definitions and aggregate rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::entity::EntityType;
use crate::error::PipelineError;

/// A business-level rollup over conformed encounters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mart {
    /// Encounters per month and department.
    Department,
    /// Encounters per organization and month, with average length of stay.
    OrganizationMonth,
    /// Encounters per payer and month, with coverage ratio.
    Payer,
}

impl Mart {
    /// Every mart, in build order.
    pub const ALL: [Self; 3] = [Self::Department, Self::OrganizationMonth, Self::Payer];

    /// Stable name used in storage paths and view names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Department => "department",
            Self::OrganizationMonth => "organization_month",
            Self::Payer => "payer",
        }
    }

    /// Column holding the grouping key besides `month`.
    #[must_use]
    pub const fn key_column(self) -> &'static str {
        match self {
            Self::Department => "department",
            Self::OrganizationMonth => "organization_id",
            Self::Payer => "payer_id",
        }
    }

    /// Column holding the joined dimension name, if the mart has one.
    #[must_use]
    pub const fn name_column(self) -> Option<&'static str> {
        match self {
            Self::Department => None,
            Self::OrganizationMonth => Some("organization_name"),
            Self::Payer => Some("payer_name"),
        }
    }

    /// Column holding the mart-specific measure, if any.
    #[must_use]
    pub const fn derived_column(self) -> Option<&'static str> {
        match self {
            Self::Department => None,
            Self::OrganizationMonth => Some("avg_length_of_stay_hours"),
            Self::Payer => Some("coverage_ratio"),
        }
    }

    /// Dimension joined for names; a change to it affects every partition.
    #[must_use]
    pub const fn dimension(self) -> Option<EntityType> {
        match self {
            Self::Department => None,
            Self::OrganizationMonth => Some(EntityType::Organization),
            Self::Payer => Some(EntityType::Payer),
        }
    }

    /// Conformed entity types the mart reads.
    #[must_use]
    pub fn inputs(self) -> Vec<EntityType> {
        std::iter::once(EntityType::Encounter)
            .chain(self.dimension())
            .collect()
    }
}

impl fmt::Display for Mart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mart {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| PipelineError::Config {
                message: format!(
                    "unknown mart '{s}' (expected one of: department, organization_month, payer)"
                ),
            })
    }
}

/// One row of a mart partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    /// `YYYY-MM` of the encounters' admission.
    pub month: String,
    /// Grouping key: department, organization id, or payer id.
    pub key: String,
    /// Joined dimension name.
    pub name: Option<String>,
    /// Encounters in the group.
    pub encounter_count: i64,
    /// Distinct patients in the group.
    pub distinct_patients: i64,
    /// Sum of total claim cost.
    pub total_claim_cost: f64,
    /// Sum of payer coverage.
    pub total_payer_coverage: f64,
    /// Mart-specific measure.
    pub derived: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for mart in Mart::ALL {
            assert_eq!(mart.as_str().parse::<Mart>().unwrap(), mart);
        }
        assert!("revenue".parse::<Mart>().is_err());
    }

    #[test]
    fn dimension_marts_read_their_dimension() {
        assert_eq!(Mart::Department.inputs(), vec![EntityType::Encounter]);
        assert_eq!(
            Mart::Payer.inputs(),
            vec![EntityType::Encounter, EntityType::Payer]
        );
    }
}
