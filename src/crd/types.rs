//! Supporting types for the NodePool CRD

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Capacity type of an offering
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum CapacityType {
    /// On-demand capacity, stable pricing, never reclaimed
    #[default]
    OnDemand,
    /// Spot capacity, discounted, reclaimable with a short warning
    Spot,
}

impl std::str::FromStr for CapacityType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-demand" => Ok(Self::OnDemand),
            "spot" => Ok(Self::Spot),
            _ => Err(crate::Error::validation(format!(
                "invalid capacity type: {s}, expected one of: on-demand, spot"
            ))),
        }
    }
}

impl std::fmt::Display for CapacityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnDemand => write!(f, "on-demand"),
            Self::Spot => write!(f, "spot"),
        }
    }
}

/// When a pool permits voluntary consolidation of its nodes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsolidationPolicy {
    /// Only nodes carrying no reschedulable pods may be consolidated
    WhenEmpty,
    /// Empty nodes and underutilized nodes may be consolidated
    #[default]
    WhenEmptyOrUnderutilized,
}

/// Why a node is being voluntarily disrupted
///
/// Forceful paths (expiration, interruption, node repair) are not reasons in
/// this sense: they are not rate-limited by budgets and never pre-spin
/// replacements.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DisruptionReason {
    /// The node carries no reschedulable pods
    Empty,
    /// The node's pods would fit elsewhere for less money
    Underutilized,
    /// The node's observed spec diverged from its owning pool template
    Drifted,
}

impl DisruptionReason {
    /// All voluntary reasons, in evaluation order
    pub const ALL: [DisruptionReason; 3] = [Self::Drifted, Self::Empty, Self::Underutilized];
}

impl std::fmt::Display for DisruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty"),
            Self::Underutilized => write!(f, "Underutilized"),
            Self::Drifted => write!(f, "Drifted"),
        }
    }
}

/// Operator for a single node requirement
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequirementOperator {
    /// Label value must be one of the listed values
    In,
    /// Label value must not be any of the listed values
    NotIn,
    /// Label must be present, values ignored
    Exists,
    /// Label must be absent, values ignored
    DoesNotExist,
    /// Label value, parsed as an integer, must be greater than values[0]
    Gt,
    /// Label value, parsed as an integer, must be less than values[0]
    Lt,
}

/// A single label requirement on nodes produced by a pool
///
/// Mirrors the Kubernetes `NodeSelectorRequirement` shape so pool templates
/// read like node affinity terms.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    /// Label key the requirement applies to
    pub key: String,

    /// Comparison operator
    pub operator: RequirementOperator,

    /// Values compared against; meaning depends on the operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    /// Whether a label value (or its absence) satisfies this requirement
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self.operator {
            RequirementOperator::In => {
                value.is_some_and(|v| self.values.iter().any(|x| x == v))
            }
            RequirementOperator::NotIn => {
                value.map_or(true, |v| !self.values.iter().any(|x| x == v))
            }
            RequirementOperator::Exists => value.is_some(),
            RequirementOperator::DoesNotExist => value.is_none(),
            RequirementOperator::Gt => match (value, self.values.first()) {
                (Some(v), Some(bound)) => {
                    matches!((v.parse::<i64>(), bound.parse::<i64>()), (Ok(a), Ok(b)) if a > b)
                }
                _ => false,
            },
            RequirementOperator::Lt => match (value, self.values.first()) {
                (Some(v), Some(bound)) => {
                    matches!((v.parse::<i64>(), bound.parse::<i64>()), (Ok(a), Ok(b)) if a < b)
                }
                _ => false,
            },
        }
    }

    /// Validate the requirement shape
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.key.is_empty() {
            return Err(crate::Error::validation("requirement key cannot be empty"));
        }
        match self.operator {
            RequirementOperator::In if self.values.is_empty() => Err(crate::Error::validation(
                format!("requirement on '{}' uses In with no values", self.key),
            )),
            RequirementOperator::Gt | RequirementOperator::Lt if self.values.len() != 1 => {
                Err(crate::Error::validation(format!(
                    "requirement on '{}' uses Gt/Lt with {} values, expected exactly 1",
                    self.key,
                    self.values.len()
                )))
            }
            _ => Ok(()),
        }
    }
}

/// A rate-limit rule on concurrent voluntary disruptions in a pool
///
/// `nodes` is either an absolute count ("5") or a percentage of the pool
/// ("20%"). An empty `reasons` list applies the budget to all reasons. When
/// `schedule` (five-field cron or an @-macro, always UTC) is set, `duration`
/// must also be set and the budget is active only inside the window.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    /// Maximum disruptable nodes: absolute count or percentage string
    pub nodes: String,

    /// Reasons this budget applies to; empty means all reasons
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<DisruptionReason>,

    /// Cron expression opening the window, evaluated in UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Window length, Go duration string (e.g. "10m", "1h")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// Parsed form of a budget's `nodes` field
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetValue {
    /// Absolute node count
    Absolute(u32),
    /// Percentage of the pool, 0..=100
    Percent(u32),
}

impl Budget {
    /// Parse the `nodes` field
    pub fn value(&self) -> Result<BudgetValue, crate::Error> {
        let s = self.nodes.trim();
        if let Some(pct) = s.strip_suffix('%') {
            let pct: u32 = pct.parse().map_err(|_| {
                crate::Error::validation(format!("budget nodes '{}' has invalid percent", s))
            })?;
            if pct > 100 {
                return Err(crate::Error::validation(format!(
                    "budget nodes '{}' exceeds 100%",
                    s
                )));
            }
            Ok(BudgetValue::Percent(pct))
        } else {
            let n: u32 = s.parse().map_err(|_| {
                crate::Error::validation(format!("budget nodes '{}' is not a count or percent", s))
            })?;
            Ok(BudgetValue::Absolute(n))
        }
    }

    /// Whether this budget applies to the given reason
    pub fn applies_to(&self, reason: DisruptionReason) -> bool {
        self.reasons.is_empty() || self.reasons.contains(&reason)
    }

    /// Validate field shapes: nodes parses, schedule and duration co-exist,
    /// the cron expression compiles, the duration parses.
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.value()?;
        match (&self.schedule, &self.duration) {
            (None, None) => Ok(()),
            (Some(schedule), Some(duration)) => {
                crate::disruption::budgets::compile_schedule(schedule)?;
                parse_duration(duration)?;
                Ok(())
            }
            _ => Err(crate::Error::validation(
                "budget schedule and duration must be set together",
            )),
        }
    }
}

/// Parse a Go-style duration string (e.g. "1h", "30m", "15s", "1h30m").
///
/// Accepts combinations of hours (h), minutes (m), and seconds (s), in that
/// order, each at most once.
pub fn parse_duration(s: &str) -> Result<Duration, crate::Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::validation("duration cannot be empty"));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut seen_unit = false;

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        if number.is_empty() {
            return Err(crate::Error::validation(format!(
                "missing number before unit '{ch}' in duration '{s}'"
            )));
        }
        let value: u64 = number.parse().map_err(|_| {
            crate::Error::validation(format!("invalid number in duration '{s}'"))
        })?;
        let unit = match ch {
            'h' => Duration::from_secs(3600),
            'm' => Duration::from_secs(60),
            's' => Duration::from_secs(1),
            other => {
                return Err(crate::Error::validation(format!(
                    "invalid duration unit '{other}' in '{s}' (expected h, m, or s)"
                )))
            }
        };
        total += unit * value as u32;
        number.clear();
        seen_unit = true;
    }

    if !number.is_empty() {
        return Err(crate::Error::validation(format!(
            "missing unit suffix (h/m/s) in duration '{s}'"
        )));
    }
    if !seen_unit {
        return Err(crate::Error::validation(format!(
            "no duration units found in '{s}'"
        )));
    }
    Ok(total)
}

/// Parse an optional lifecycle duration where "Never" disables the field
pub fn parse_lifecycle_duration(s: &str) -> Result<Option<Duration>, crate::Error> {
    if s == "Never" {
        return Ok(None);
    }
    parse_duration(s).map(Some)
}
