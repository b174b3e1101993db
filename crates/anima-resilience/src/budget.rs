//! Priority-based per-cycle resource budget. Critical tasks are always
//! admitted; important and optional tasks are admitted only while their
//! class has both LLM calls and wall-clock left.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use anima_types::Priority;

/// Per-class budget: a call cap and a time cap.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BudgetLimits {
    /// Max LLM calls per cycle.
    pub llm_calls: u32,
    /// Max accumulated seconds per cycle.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
struct ClassUsage {
    llm_calls: u32,
    time_seconds: f64,
    tasks_executed: u32,
    tasks_skipped: u32,
}

/// Per-class slice of the usage report.
#[derive(Debug, Clone, Serialize)]
pub struct ClassReport {
    /// Configured caps.
    pub budget: BudgetLimits,
    /// Raw usage.
    pub used: UsedReport,
    /// What remains.
    pub remaining: BudgetLimits,
    /// Utilization percentages.
    pub utilization: UtilizationReport,
}

/// Raw usage numbers.
#[derive(Debug, Clone, Serialize)]
pub struct UsedReport {
    /// LLM calls consumed.
    pub llm_calls: u32,
    /// Seconds consumed.
    pub time_seconds: f64,
    /// Tasks that ran.
    pub tasks_executed: u32,
    /// Tasks refused or failed admission.
    pub tasks_skipped: u32,
}

/// Utilization percentages.
#[derive(Debug, Clone, Serialize)]
pub struct UtilizationReport {
    /// Percentage of the call cap consumed.
    pub llm_calls_pct: f64,
    /// Percentage of the time cap consumed.
    pub time_pct: f64,
}

/// Full per-cycle usage report.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetReport {
    /// Seconds since the cycle started.
    pub cycle_duration_secs: f64,
    /// Per-class slices keyed by priority name.
    pub priorities: HashMap<String, ClassReport>,
}

/// The per-tick accountant. Reset at the start of every heavy-tick cycle.
#[derive(Debug)]
pub struct PriorityBudget {
    limits: HashMap<Priority, BudgetLimits>,
    inner: Mutex<(HashMap<Priority, ClassUsage>, Instant)>,
}

impl Default for PriorityBudget {
    fn default() -> Self {
        Self::new(HashMap::from([
            (Priority::Critical, BudgetLimits { llm_calls: 20, timeout_seconds: 180 }),
            (Priority::Important, BudgetLimits { llm_calls: 10, timeout_seconds: 90 }),
            (Priority::Optional, BudgetLimits { llm_calls: 5, timeout_seconds: 45 }),
        ]))
    }
}

impl PriorityBudget {
    /// Create with explicit per-class limits.
    pub fn new(limits: HashMap<Priority, BudgetLimits>) -> Self {
        for p in Priority::ALL {
            debug_assert!(limits.contains_key(&p));
        }
        let usage = Priority::ALL.iter().map(|p| (*p, ClassUsage::default())).collect();
        Self { limits, inner: Mutex::new((usage, Instant::now())) }
    }

    fn limits_of(&self, priority: Priority) -> BudgetLimits {
        *self
            .limits
            .get(&priority)
            .unwrap_or(&BudgetLimits { llm_calls: 0, timeout_seconds: 0 })
    }

    /// Admission check. Critical always passes; important/optional pass only
    /// if neither the call cap nor the time cap would be exceeded.
    pub fn can_execute(
        &self,
        priority: Priority,
        llm_calls: u32,
        estimated_duration: Duration,
    ) -> bool {
        if priority == Priority::Critical {
            return true;
        }
        let limits = self.limits_of(priority);
        let guard = self.inner.lock();
        let used = guard.0.get(&priority).copied().unwrap_or_default();

        if used.llm_calls + llm_calls > limits.llm_calls {
            debug!(
                priority = priority.as_str(),
                used = used.llm_calls,
                requested = llm_calls,
                cap = limits.llm_calls,
                "LLM budget exhausted"
            );
            return false;
        }
        if used.time_seconds + estimated_duration.as_secs_f64() > limits.timeout_seconds as f64 {
            debug!(
                priority = priority.as_str(),
                used_secs = used.time_seconds,
                cap_secs = limits.timeout_seconds,
                "time budget exhausted"
            );
            return false;
        }
        true
    }

    /// Deduct consumed resources after a task ran.
    pub fn record_usage(&self, priority: Priority, llm_calls: u32, duration: Duration) {
        let mut guard = self.inner.lock();
        let used = guard.0.entry(priority).or_default();
        used.llm_calls += llm_calls;
        used.time_seconds += duration.as_secs_f64();
        used.tasks_executed += 1;
    }

    /// Add wall time consumed by an already-admitted task, without touching
    /// the call or task counters. Used when calls are reserved at admission
    /// and the duration only becomes known at completion.
    pub fn record_duration(&self, priority: Priority, duration: Duration) {
        let mut guard = self.inner.lock();
        guard.0.entry(priority).or_default().time_seconds += duration.as_secs_f64();
    }

    /// Count a skipped task.
    pub fn record_skip(&self, priority: Priority, reason: &str) {
        let mut guard = self.inner.lock();
        guard.0.entry(priority).or_default().tasks_skipped += 1;
        info!(priority = priority.as_str(), reason, "task skipped");
    }

    /// Zero all classes and stamp the new cycle start.
    pub fn reset_cycle(&self) {
        let mut guard = self.inner.lock();
        for usage in guard.0.values_mut() {
            *usage = ClassUsage::default();
        }
        guard.1 = Instant::now();
        debug!("budget cycle reset");
    }

    /// What remains for a class.
    pub fn remaining(&self, priority: Priority) -> BudgetLimits {
        let limits = self.limits_of(priority);
        let guard = self.inner.lock();
        let used = guard.0.get(&priority).copied().unwrap_or_default();
        BudgetLimits {
            llm_calls: limits.llm_calls.saturating_sub(used.llm_calls),
            timeout_seconds: limits
                .timeout_seconds
                .saturating_sub(used.time_seconds as u64),
        }
    }

    /// Per-class raw numbers and utilization percentages.
    pub fn usage_report(&self) -> BudgetReport {
        let guard = self.inner.lock();
        let mut priorities = HashMap::new();
        for p in Priority::ALL {
            let limits = self.limits_of(p);
            let used = guard.0.get(&p).copied().unwrap_or_default();
            let calls_pct = if limits.llm_calls > 0 {
                used.llm_calls as f64 / limits.llm_calls as f64 * 100.0
            } else {
                0.0
            };
            let time_pct = if limits.timeout_seconds > 0 {
                used.time_seconds / limits.timeout_seconds as f64 * 100.0
            } else {
                0.0
            };
            priorities.insert(
                p.as_str().to_string(),
                ClassReport {
                    budget: limits,
                    used: UsedReport {
                        llm_calls: used.llm_calls,
                        time_seconds: used.time_seconds,
                        tasks_executed: used.tasks_executed,
                        tasks_skipped: used.tasks_skipped,
                    },
                    remaining: BudgetLimits {
                        llm_calls: limits.llm_calls.saturating_sub(used.llm_calls),
                        timeout_seconds: limits
                            .timeout_seconds
                            .saturating_sub(used.time_seconds as u64),
                    },
                    utilization: UtilizationReport {
                        llm_calls_pct: calls_pct,
                        time_pct,
                    },
                },
            );
        }
        BudgetReport { cycle_duration_secs: guard.1.elapsed().as_secs_f64(), priorities }
    }

    /// Log a one-line-per-class cycle summary.
    pub fn log_summary(&self) {
        let report = self.usage_report();
        for p in Priority::ALL {
            if let Some(class) = report.priorities.get(p.as_str()) {
                info!(
                    priority = p.as_str(),
                    calls = format!("{}/{}", class.used.llm_calls, class.budget.llm_calls),
                    time = format!(
                        "{:.0}/{}s",
                        class.used.time_seconds, class.budget.timeout_seconds
                    ),
                    executed = class.used.tasks_executed,
                    skipped = class.used.tasks_skipped,
                    "budget summary"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_is_always_admitted() {
        let budget = PriorityBudget::default();
        budget.record_usage(Priority::Critical, 1000, Duration::from_secs(10_000));
        assert!(budget.can_execute(Priority::Critical, 100, Duration::from_secs(100)));
    }

    #[test]
    fn optional_is_refused_past_call_cap() {
        let budget = PriorityBudget::default();
        assert!(budget.can_execute(Priority::Optional, 5, Duration::ZERO));
        budget.record_usage(Priority::Optional, 5, Duration::from_secs(1));
        assert!(!budget.can_execute(Priority::Optional, 1, Duration::ZERO));
    }

    #[test]
    fn important_is_refused_past_time_cap() {
        let budget = PriorityBudget::default();
        budget.record_usage(Priority::Important, 0, Duration::from_secs(89));
        assert!(budget.can_execute(Priority::Important, 0, Duration::from_secs(1)));
        assert!(!budget.can_execute(Priority::Important, 0, Duration::from_secs(5)));
    }

    #[test]
    fn reset_cycle_restores_full_budget() {
        let budget = PriorityBudget::default();
        budget.record_usage(Priority::Optional, 5, Duration::from_secs(45));
        assert!(!budget.can_execute(Priority::Optional, 1, Duration::ZERO));

        budget.reset_cycle();
        assert!(budget.can_execute(Priority::Optional, 1, Duration::ZERO));
        assert_eq!(budget.remaining(Priority::Optional).llm_calls, 5);
    }

    #[test]
    fn usage_never_exceeds_caps_when_gated() {
        let budget = PriorityBudget::default();
        let mut admitted = 0;
        for _ in 0..20 {
            if budget.can_execute(Priority::Optional, 1, Duration::ZERO) {
                budget.record_usage(Priority::Optional, 1, Duration::ZERO);
                admitted += 1;
            } else {
                budget.record_skip(Priority::Optional, "cap reached");
            }
        }
        assert_eq!(admitted, 5);
        let report = budget.usage_report();
        let optional = &report.priorities["OPTIONAL"];
        assert_eq!(optional.used.llm_calls, 5);
        assert_eq!(optional.used.tasks_skipped, 15);
        assert_eq!(optional.utilization.llm_calls_pct, 100.0);
    }

    #[test]
    fn report_covers_all_classes() {
        let budget = PriorityBudget::default();
        let report = budget.usage_report();
        assert_eq!(report.priorities.len(), 3);
        assert!(report.priorities.contains_key("CRITICAL"));
        assert!(report.priorities.contains_key("IMPORTANT"));
        assert!(report.priorities.contains_key("OPTIONAL"));
    }
}
