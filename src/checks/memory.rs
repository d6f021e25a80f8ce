//! Wired memory leak check.

use super::leak::{track, Reading};
use super::{Check, CheckContext};
use crate::models::CheckOutcome;
use crate::trend::parse_numeric;
use anyhow::Result;
use async_trait::async_trait;

const COMMAND: &str = "sysctl -n vm.stats.vm.v_wire_count";
const FAMILY: &str = "mem";
const LABEL: &str = "wired_pages";

/// Tracks wired pages per node and reports leaking nodes.
pub struct MemoryCheck;

#[async_trait]
impl Check for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "wired memory trend of every online node"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckOutcome> {
        let result = ctx.fan_out(COMMAND, false).await;
        let mut exec_errors = result.execution_errors();

        let mut readings = Vec::new();
        for lnn in ctx.snapshot.online() {
            let output = result.output(lnn);
            match output.lines().next().and_then(parse_numeric) {
                Some(value) => readings.push(Reading { lnn, value }),
                None => {
                    let text = format!("non-numeric '{}' output: {}", COMMAND, output.trim());
                    exec_errors += ctx.unreadable(&result, lnn, text);
                }
            }
        }

        let leaks = track(ctx, FAMILY, LABEL, "pages", &readings)?;
        Ok((exec_errors, 0, leaks).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::tests::Harness;
    use crate::fanout::executor::tests::FakeRemote;
    use crate::models::{Lnn, Severity};
    use crate::trend::TrendStore;
    use std::fs;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_samples_recorded_per_node() {
        let remote = FakeRemote::per_node("tc", vec![Lnn(1), Lnn(2), Lnn(3)], |_, lnn| match lnn.0 {
            3 => "sysctl: unknown oid".to_string(),
            n => format!("{}", 1000 * n),
        });
        let mut harness = Harness::new(Arc::new(remote));

        let outcome = MemoryCheck.run(&mut harness.ctx()).await.unwrap();

        assert_eq!(outcome, CheckOutcome::from((1, 0, 0)));
        let rows = fs::read_to_string(harness.dir.path().join(TrendStore::file_name(FAMILY))).unwrap();
        assert_eq!(
            rows,
            "1700000000,1,wired_pages,1000,pages\n1700000000,2,wired_pages,2000,pages\n"
        );
        assert_eq!(harness.texts(Lnn(3), Severity::Exec).len(), 1);
    }
}
