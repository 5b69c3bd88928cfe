use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;
use crate::rotation::Sponsored;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Draft,
    Active,
    Paused,
    Exhausted,
}

impl PromotionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for PromotionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PromotionStatus {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "exhausted" => Ok(Self::Exhausted),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

/// A paid placement of a service on the landing page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    pub service_id: String,
    pub title: String,
    pub budget: f64,
    pub status: PromotionStatus,
}

impl Promotion {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.trim().is_empty() {
            return Err(DomainError::MissingField("id"));
        }
        if !self.budget.is_finite() {
            return Err(DomainError::InvalidBudget(self.budget));
        }
        Ok(())
    }
}

impl Sponsored for Promotion {
    fn id(&self) -> &str {
        &self.id
    }

    fn budget(&self) -> f64 {
        self.budget
    }

    fn is_active(&self) -> bool {
        self.status == PromotionStatus::Active
    }
}
