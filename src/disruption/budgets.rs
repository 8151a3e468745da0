//! Disruption budget evaluation
//!
//! A budget bounds how many of a pool's nodes may be voluntarily disrupted
//! at once, per reason, optionally only inside a cron-scheduled window.
//! Budgets are computed once at the start of an orchestrator tick and not
//! re-read mid-tick.
//!
//! Budgets do not gate the forceful paths (expiration, interruption, node
//! repair), but nodes those paths are deleting still count against the
//! `deleting` term and so shrink the headroom left for graceful disruption.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::crd::{parse_duration, Budget, BudgetValue, DisruptionReason, NodePool};
use crate::state::PoolCounts;

/// Default budget applied when a pool declares none: 10%, all reasons
const DEFAULT_BUDGET_PERCENT: u32 = 10;

/// Compile a budget schedule expression
///
/// Accepts the five-field cron form and the `@yearly`/`@monthly`/`@weekly`/
/// `@daily`/`@hourly` macros. Always evaluated in UTC; there is no timezone
/// option. The parser wants a seconds field, so five-field expressions are
/// pinned to second zero.
pub fn compile_schedule(expr: &str) -> Result<Schedule, crate::Error> {
    let expr = expr.trim();
    let normalized = if expr.starts_with('@') || expr.split_whitespace().count() != 5 {
        expr.to_string()
    } else {
        format!("0 {expr}")
    };
    Schedule::from_str(&normalized).map_err(|e| {
        crate::Error::validation(format!("budget schedule '{expr}' is not valid cron: {e}"))
    })
}

/// Whether a budget's window covers `now`
///
/// A budget without a schedule is always active. With one, the window opens
/// at the first fire time after `now - duration` and stays open for
/// `duration`.
pub fn budget_active(budget: &Budget, now: DateTime<Utc>) -> Result<bool, crate::Error> {
    let (Some(schedule), Some(duration)) = (&budget.schedule, &budget.duration) else {
        return Ok(true);
    };
    let schedule = compile_schedule(schedule)?;
    let duration = Duration::from_std(parse_duration(duration)?)
        .map_err(|_| crate::Error::validation("budget duration out of range"))?;

    match schedule.after(&(now - duration)).next() {
        Some(fire) => Ok(fire <= now),
        None => Ok(false),
    }
}

// ceil(total * percent / 100) in integers
fn percent_ceil(total: u32, percent: u32) -> u32 {
    (total * percent).div_ceil(100)
}

/// Nodes a single budget still allows to be disrupted
///
/// Nodes already being deleted (by any actor) and nodes that are not ready
/// consume headroom before new disruptions do.
fn budget_allows(budget_value: BudgetValue, counts: PoolCounts) -> i64 {
    let cap = match budget_value {
        BudgetValue::Absolute(n) => i64::from(n),
        BudgetValue::Percent(pct) => i64::from(percent_ceil(counts.total, pct)),
    };
    cap - i64::from(counts.deleting) - i64::from(counts.not_ready)
}

/// Nodes a pool may have voluntarily disrupted for `reason` at `now`
///
/// The minimum over all active budgets that cover the reason, clamped to
/// zero. A pool without budgets gets the default 10% budget for all reasons.
pub fn allowed_disruptions(
    pool: &NodePool,
    counts: PoolCounts,
    reason: DisruptionReason,
    now: DateTime<Utc>,
) -> Result<u32, crate::Error> {
    let budgets = &pool.spec.disruption.budgets;
    let mut min_allowed: Option<i64> = None;

    for budget in budgets {
        if !budget.applies_to(reason) || !budget_active(budget, now)? {
            continue;
        }
        let allowed = budget_allows(budget.value()?, counts);
        min_allowed = Some(min_allowed.map_or(allowed, |m| m.min(allowed)));
    }

    let allowed = min_allowed.unwrap_or_else(|| {
        budget_allows(BudgetValue::Percent(DEFAULT_BUDGET_PERCENT), counts)
    });
    Ok(allowed.max(0) as u32)
}

/// Budgets for every (pool, reason), computed once at tick start
#[derive(Debug, Default)]
pub struct BudgetSnapshot {
    allowed: HashMap<(String, DisruptionReason), u32>,
}

impl BudgetSnapshot {
    /// Evaluate every pool's budgets against current node counts
    pub fn compute(
        pools: &[NodePool],
        counts: &std::collections::BTreeMap<String, PoolCounts>,
        now: DateTime<Utc>,
    ) -> Result<Self, crate::Error> {
        let mut allowed = HashMap::new();
        for pool in pools {
            let name = pool
                .metadata
                .name
                .clone()
                .ok_or_else(|| crate::Error::validation("pool has no name"))?;
            let pool_counts = counts.get(&name).copied().unwrap_or_default();
            for reason in DisruptionReason::ALL {
                allowed.insert(
                    (name.clone(), reason),
                    allowed_disruptions(pool, pool_counts, reason, now)?,
                );
            }
        }
        Ok(Self { allowed })
    }

    /// Remaining headroom for a pool and reason
    pub fn remaining(&self, pool: &str, reason: DisruptionReason) -> u32 {
        self.allowed
            .get(&(pool.to_string(), reason))
            .copied()
            .unwrap_or(0)
    }

    /// Consume headroom as nodes are chosen within the tick
    pub fn consume(&mut self, pool: &str, reason: DisruptionReason, nodes: u32) {
        if let Some(entry) = self.allowed.get_mut(&(pool.to_string(), reason)) {
            *entry = entry.saturating_sub(nodes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{DisruptionSpec, NodePoolSpec, NodeTemplate};
    use chrono::TimeZone;

    fn pool_with_budgets(budgets: Vec<Budget>) -> NodePool {
        let mut pool = NodePool::new(
            "default",
            NodePoolSpec {
                template: NodeTemplate::default(),
                disruption: DisruptionSpec {
                    budgets,
                    ..Default::default()
                },
                weight: None,
                limits: None,
            },
        );
        pool.metadata.name = Some("default".into());
        pool
    }

    fn counts(total: u32, deleting: u32, not_ready: u32) -> PoolCounts {
        PoolCounts {
            total,
            deleting,
            not_ready,
        }
    }

    #[test]
    fn test_default_budget_is_ten_percent() {
        let pool = pool_with_budgets(vec![]);
        let allowed =
            allowed_disruptions(&pool, counts(25, 0, 0), DisruptionReason::Empty, Utc::now())
                .unwrap();
        // ceil(25 * 10%) = 3
        assert_eq!(allowed, 3);
    }

    /// A 20% budget over 19 nodes admits ceil(3.8) = 4 concurrent
    /// disruptions; the fifth candidate waits for the next tick.
    #[test]
    fn test_percentage_budget_rounds_up() {
        let pool = pool_with_budgets(vec![Budget {
            nodes: "20%".into(),
            reasons: vec![DisruptionReason::Empty, DisruptionReason::Drifted],
            schedule: None,
            duration: None,
        }]);
        let allowed =
            allowed_disruptions(&pool, counts(19, 0, 0), DisruptionReason::Drifted, Utc::now())
                .unwrap();
        assert_eq!(allowed, 4);
    }

    #[test]
    fn test_deleting_and_not_ready_shrink_headroom() {
        let pool = pool_with_budgets(vec![Budget {
            nodes: "5".into(),
            reasons: vec![],
            schedule: None,
            duration: None,
        }]);
        // two forceful terminations in flight and one unready node
        let allowed =
            allowed_disruptions(&pool, counts(10, 2, 1), DisruptionReason::Empty, Utc::now())
                .unwrap();
        assert_eq!(allowed, 2);

        // headroom never goes negative
        let allowed =
            allowed_disruptions(&pool, counts(10, 4, 3), DisruptionReason::Empty, Utc::now())
                .unwrap();
        assert_eq!(allowed, 0);
    }

    #[test]
    fn test_min_over_active_budgets_wins() {
        let pool = pool_with_budgets(vec![
            Budget {
                nodes: "50%".into(),
                reasons: vec![],
                schedule: None,
                duration: None,
            },
            Budget {
                nodes: "1".into(),
                reasons: vec![DisruptionReason::Drifted],
                schedule: None,
                duration: None,
            },
        ]);
        let drifted =
            allowed_disruptions(&pool, counts(10, 0, 0), DisruptionReason::Drifted, Utc::now())
                .unwrap();
        assert_eq!(drifted, 1);

        let empty =
            allowed_disruptions(&pool, counts(10, 0, 0), DisruptionReason::Empty, Utc::now())
                .unwrap();
        assert_eq!(empty, 5);
    }

    /// A zero budget scheduled `@daily` for ten minutes closes underutilized
    /// disruption inside the window and leaves other reasons untouched.
    #[test]
    fn test_cron_window_closes_reason() {
        let pool = pool_with_budgets(vec![Budget {
            nodes: "0".into(),
            reasons: vec![DisruptionReason::Underutilized],
            schedule: Some("@daily".into()),
            duration: Some("10m".into()),
        }]);

        // 00:05 UTC, inside the window
        let inside = Utc.with_ymd_and_hms(2025, 6, 1, 0, 5, 0).unwrap();
        let allowed =
            allowed_disruptions(&pool, counts(10, 0, 0), DisruptionReason::Underutilized, inside)
                .unwrap();
        assert_eq!(allowed, 0);

        // drift is not covered by the zero budget; default applies
        let drift =
            allowed_disruptions(&pool, counts(10, 0, 0), DisruptionReason::Drifted, inside)
                .unwrap();
        assert_eq!(drift, 1);

        // 00:15 UTC, outside the window: the zero budget is dormant
        let outside = Utc.with_ymd_and_hms(2025, 6, 1, 0, 15, 0).unwrap();
        let allowed = allowed_disruptions(
            &pool,
            counts(10, 0, 0),
            DisruptionReason::Underutilized,
            outside,
        )
        .unwrap();
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_five_field_cron_accepted() {
        assert!(compile_schedule("0 9 * * 1-5").is_ok());
        assert!(compile_schedule("@hourly").is_ok());
        assert!(compile_schedule("not a schedule").is_err());
    }

    #[test]
    fn test_window_boundaries() {
        let budget = Budget {
            nodes: "0".into(),
            reasons: vec![],
            schedule: Some("0 9 * * *".into()),
            duration: Some("1h".into()),
        };

        let before = Utc.with_ymd_and_hms(2025, 6, 1, 8, 59, 0).unwrap();
        assert!(!budget_active(&budget, before).unwrap());

        let at_open = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        assert!(budget_active(&budget, at_open).unwrap());

        let mid = Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap();
        assert!(budget_active(&budget, mid).unwrap());

        let after = Utc.with_ymd_and_hms(2025, 6, 1, 10, 1, 0).unwrap();
        assert!(!budget_active(&budget, after).unwrap());
    }

    #[test]
    fn test_snapshot_consume() {
        let pool = pool_with_budgets(vec![Budget {
            nodes: "3".into(),
            reasons: vec![],
            schedule: None,
            duration: None,
        }]);
        let counts_map =
            std::collections::BTreeMap::from([("default".to_string(), counts(10, 0, 0))]);
        let mut snapshot = BudgetSnapshot::compute(&[pool], &counts_map, Utc::now()).unwrap();

        assert_eq!(snapshot.remaining("default", DisruptionReason::Empty), 3);
        snapshot.consume("default", DisruptionReason::Empty, 2);
        assert_eq!(snapshot.remaining("default", DisruptionReason::Empty), 1);
        snapshot.consume("default", DisruptionReason::Empty, 5);
        assert_eq!(snapshot.remaining("default", DisruptionReason::Empty), 0);

        // unknown pools have no headroom
        assert_eq!(snapshot.remaining("missing", DisruptionReason::Empty), 0);
    }
}
