//! Ordered execution of the selected checks.

use super::{Check, CheckContext, CheckRegistry};
use crate::config::ChecksConfig;
use crate::error::ClusterCheckError;
use crate::models::{CheckOutcome, ErrorTotals, Severity};
use crate::report::TIMESTAMP_FORMAT;
use chrono::Local;
use std::collections::BTreeSet;
use std::time::Instant;
use tracing::{info, warn};

/// Completion line of one check.
pub fn completion_line(name: &str, minutes: f64, outcome: &CheckOutcome) -> String {
    let mut line = format!(
        "({:.2} min) check '{}' found {} execution errors, {} threshold errors",
        minutes, name, outcome.execution_errors, outcome.threshold_errors
    );
    if let Some(leaks) = outcome.leaks {
        line.push_str(&format!(", {} leaks", leaks));
    }
    line
}

/// Runs checks from a registry under the deferred policy.
pub struct CheckRunner<'r> {
    registry: &'r CheckRegistry,
    policy: &'r ChecksConfig,
}

impl<'r> CheckRunner<'r> {
    pub fn new(registry: &'r CheckRegistry, policy: &'r ChecksConfig) -> Self {
        Self { registry, policy }
    }

    /// Run `names` in lexicographic order and sum their outcomes.
    ///
    /// Every name is resolved before the first check runs, so an unknown
    /// name aborts without side effects. A check that returns an error
    /// counts as one execution error. Deferred checks only contribute
    /// their leaks to the totals.
    pub async fn run(
        &self,
        names: &BTreeSet<String>,
        ctx: &mut CheckContext<'_>,
    ) -> Result<ErrorTotals, ClusterCheckError> {
        let checks: Vec<Box<dyn Check>> = names
            .iter()
            .map(|name| self.registry.create(name))
            .collect::<Result<_, _>>()?;

        let mut totals = ErrorTotals::default();
        for check in checks {
            let name = check.name();
            info!("Running check {}", name);
            ctx.record(
                None,
                Severity::Banner,
                format!("Check '{}' started at {}", name, Local::now().format(TIMESTAMP_FORMAT)),
            );

            let started = Instant::now();
            let outcome = match check.run(ctx).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Check {} failed: {:#}", name, e);
                    ctx.record(None, Severity::Exec, format!("check '{}' failed: {:#}", name, e));
                    CheckOutcome::from((1, 0))
                }
            };
            let minutes = started.elapsed().as_secs_f64() / 60.0;
            ctx.record(None, Severity::Summary, completion_line(name, minutes, &outcome));

            let deferred = self.policy.deferral(name);
            if let Some(reason) = deferred {
                if !outcome.is_clean() {
                    ctx.record(
                        None,
                        Severity::Info,
                        format!("Errors of deferred check '{}' are not counted: {}", name, reason),
                    );
                }
            }
            totals.add_outcome(&outcome, deferred.is_some());
        }
        Ok(totals)
    }
}
