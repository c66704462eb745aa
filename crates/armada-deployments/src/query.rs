//! Deployment listing queries.
//!
//! A [`Query`] is built per request. Its phase filter compiles to a
//! [`StatsPredicate`], a small boolean expression over the status counters
//! that a store either evaluates directly ([`StatsPredicate::matches`]) or
//! renders into SQL ([`StatsPredicate::to_sql`]). The predicates agree with
//! [`Stats::phase`], so the three phase filters partition any set of
//! deployments.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deployment::{Deployment, Phase};
use crate::error::{DeploymentError, DeploymentResult};
use crate::stats::Stats;
use crate::status::DeviceDeploymentStatus;

/// Phase filter of a listing query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseFilter {
    /// No filtering.
    #[default]
    Any,
    /// Only pending deployments.
    Pending,
    /// Only deployments in progress.
    #[serde(rename = "inprogress")]
    InProgress,
    /// Only finished deployments.
    Finished,
}

impl PhaseFilter {
    /// Get the filter name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Pending => "pending",
            Self::InProgress => "inprogress",
            Self::Finished => "finished",
        }
    }

    /// Counter predicate selecting deployments in this phase.
    #[must_use]
    pub fn predicate(&self) -> StatsPredicate {
        use DeviceDeploymentStatus as S;

        let any_in_flight = || {
            StatsPredicate::Or(
                S::IN_FLIGHT
                    .into_iter()
                    .map(StatsPredicate::Positive)
                    .collect(),
            )
        };

        match self {
            Self::Any => StatsPredicate::Always,
            Self::InProgress => StatsPredicate::Or(vec![
                any_in_flight(),
                StatsPredicate::And(vec![
                    StatsPredicate::Positive(S::Pending),
                    StatsPredicate::Or(
                        S::TERMINAL
                            .into_iter()
                            .map(StatsPredicate::Positive)
                            .collect(),
                    ),
                ]),
            ]),
            Self::Pending => StatsPredicate::And(
                S::ALL
                    .into_iter()
                    .filter(|s| *s != S::Pending)
                    .map(StatsPredicate::Zero)
                    .chain(std::iter::once(StatsPredicate::Positive(S::Pending)))
                    .collect(),
            ),
            Self::Finished => StatsPredicate::And(
                S::IN_FLIGHT
                    .into_iter()
                    .chain(std::iter::once(S::Pending))
                    .map(StatsPredicate::Zero)
                    .collect(),
            ),
        }
    }
}

impl From<Phase> for PhaseFilter {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Pending => Self::Pending,
            Phase::InProgress => Self::InProgress,
            Phase::Finished => Self::Finished,
        }
    }
}

impl fmt::Display for PhaseFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PhaseFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(Self::Any),
            "pending" => Ok(Self::Pending),
            "inprogress" => Ok(Self::InProgress),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("unknown phase filter: {s}")),
        }
    }
}

/// Boolean expression over [`Stats`] counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsPredicate {
    /// Matches everything.
    Always,
    /// Counter is greater than zero.
    Positive(DeviceDeploymentStatus),
    /// Counter is exactly zero.
    Zero(DeviceDeploymentStatus),
    /// All sub-predicates hold.
    And(Vec<StatsPredicate>),
    /// At least one sub-predicate holds.
    Or(Vec<StatsPredicate>),
}

impl StatsPredicate {
    /// Evaluate against a counter snapshot.
    #[must_use]
    pub fn matches(&self, stats: &Stats) -> bool {
        match self {
            Self::Always => true,
            Self::Positive(status) => stats.get(*status) > 0,
            Self::Zero(status) => stats.get(*status) == 0,
            Self::And(parts) => parts.iter().all(|p| p.matches(stats)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(stats)),
        }
    }

    /// Render as a SQL boolean expression over one column per status.
    #[must_use]
    pub fn to_sql(&self) -> String {
        match self {
            Self::Always => "TRUE".to_owned(),
            Self::Positive(status) => format!("{} > 0", status.column()),
            Self::Zero(status) => format!("{} = 0", status.column()),
            Self::And(parts) => join_sql(parts, " AND ", "TRUE"),
            Self::Or(parts) => join_sql(parts, " OR ", "FALSE"),
        }
    }
}

fn join_sql(parts: &[StatsPredicate], separator: &str, empty: &str) -> String {
    if parts.is_empty() {
        return empty.to_owned();
    }
    let rendered: Vec<String> = parts.iter().map(StatsPredicate::to_sql).collect();
    format!("({})", rendered.join(separator))
}

/// Split free text into lowercase alphanumeric search terms.
#[must_use]
pub fn search_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Listing query over deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    /// Free text matched against name and artifact name.
    pub search_text: Option<String>,
    /// Phase filter.
    pub phase: PhaseFilter,
    /// Only deployments created at or after this time.
    pub created_after: Option<DateTime<Utc>>,
    /// Only deployments created at or before this time.
    pub created_before: Option<DateTime<Utc>>,
    /// Number of matching deployments to skip.
    pub skip: u64,
    /// Maximum number of results.
    pub limit: Option<u64>,
}

impl Query {
    /// Create a query matching every deployment.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by free text.
    #[must_use]
    pub fn with_search_text(mut self, text: impl Into<String>) -> Self {
        self.search_text = Some(text.into());
        self
    }

    /// Filter by phase.
    #[must_use]
    pub const fn with_phase(mut self, phase: PhaseFilter) -> Self {
        self.phase = phase;
        self
    }

    /// Lower creation time bound.
    #[must_use]
    pub const fn with_created_after(mut self, when: DateTime<Utc>) -> Self {
        self.created_after = Some(when);
        self
    }

    /// Upper creation time bound.
    #[must_use]
    pub const fn with_created_before(mut self, when: DateTime<Utc>) -> Self {
        self.created_before = Some(when);
        self
    }

    /// Set pagination offset.
    #[must_use]
    pub const fn with_skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Set maximum results.
    #[must_use]
    pub const fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Search terms of the text filter; `None` when there is no text filter.
    ///
    /// Text without any alphanumeric character yields `Some` of an empty
    /// list, which matches nothing.
    #[must_use]
    pub fn terms(&self) -> Option<Vec<String>> {
        self.search_text
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(search_terms)
    }

    /// Reject inverted time bounds.
    pub fn validate(&self) -> DeploymentResult<()> {
        if let (Some(after), Some(before)) = (self.created_after, self.created_before) {
            if after > before {
                return Err(DeploymentError::validation(
                    "created_after must not be later than created_before",
                ));
            }
        }
        Ok(())
    }

    /// Evaluate every filter except pagination against one deployment.
    ///
    /// `terms` is the output of [`Query::terms`], computed once per query.
    #[must_use]
    pub fn matches(&self, deployment: &Deployment, terms: Option<&[String]>) -> bool {
        if let Some(after) = self.created_after {
            if deployment.created < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if deployment.created > before {
                return false;
            }
        }
        if let Some(terms) = terms {
            let haystack = search_terms(&format!(
                "{} {}",
                deployment.name, deployment.artifact_name
            ));
            if !terms.iter().any(|t| haystack.binary_search(t).is_ok()) {
                return false;
            }
        }
        self.phase.predicate().matches(&deployment.stats)
    }
}
