//! Conflict Role
//!
//! In an asymmetric pair one cluster is the Primary (it detects and resolves
//! conflicts) and the other the Secondary (it applies whatever the Primary
//! decides). The role is configured externally, never inferred.
//!
//! - None: no role configured; asymmetric conflict functions refuse to run
//! - Primary: detects conflicts, refreshes rows, reflects secondary ops
//! - Secondary: applies idempotently, waits for reflected ops and refreshes
//! - Pass: applies every change with no checking at all

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::errors::{ApplyError, ApplyResult};

/// This cluster's position in an asymmetric conflict-resolution pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictRole {
    #[default]
    None,
    Primary,
    Secondary,
    Pass,
}

impl ConflictRole {
    /// Validate a role change.
    ///
    /// Same-role requests are idempotent. Any real change is rejected while
    /// an epoch is in flight: the operator must let the applier drain first.
    pub fn transition(self, to: ConflictRole, epoch_in_flight: bool) -> ApplyResult<Self> {
        if self == to {
            return Ok(self);
        }

        if epoch_in_flight {
            return Err(ApplyError::role_transition(format!(
                "cannot change conflict role from {} to {} while an epoch is in flight; \
                 drain the applier first",
                self, to
            )));
        }

        Ok(to)
    }

    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }

    pub fn is_secondary(&self) -> bool {
        matches!(self, Self::Secondary)
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// Get role name for observability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::Pass => "pass",
        }
    }
}

impl fmt::Display for ConflictRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictRole {
    type Err = ApplyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            "pass" => Ok(Self::Pass),
            other => Err(ApplyError::configuration(format!(
                "unknown conflict role '{}'",
                other
            ))),
        }
    }
}
