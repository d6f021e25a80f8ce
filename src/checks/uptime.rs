//! Load average check.

use super::{Check, CheckContext};
use crate::models::{CheckOutcome, Severity};
use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

const COMMAND: &str = "uptime";

fn load_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"load averages?:\s*([0-9]+(?:\.[0-9]+)?)").expect("valid load regex"))
}

/// The 1-minute load average of an `uptime` line.
pub fn parse_load(line: &str) -> Option<f64> {
    load_regex()
        .captures(line)
        .and_then(|caps| caps[1].parse().ok())
}

/// Fails nodes whose 1-minute load average exceeds `thresholds.max_load`.
pub struct UptimeCheck;

#[async_trait]
impl Check for UptimeCheck {
    fn name(&self) -> &'static str {
        "uptime"
    }

    fn description(&self) -> &'static str {
        "1-minute load average of every online node"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckOutcome> {
        let result = ctx.fan_out(COMMAND, false).await;
        let mut exec_errors = result.execution_errors();
        let mut th_errors = 0;
        let max_load = ctx.thresholds.max_load;

        for lnn in ctx.snapshot.online() {
            let output = result.output(lnn);
            match output.lines().find_map(parse_load) {
                Some(load) if load > max_load => {
                    th_errors += 1;
                    ctx.record(
                        Some(lnn),
                        Severity::Fail,
                        format!("load average {:.2} exceeds {:.2}", load, max_load),
                    );
                }
                Some(load) => {
                    ctx.record(Some(lnn), Severity::Pass, format!("load average {:.2}", load));
                }
                None => {
                    let text = format!("no load average in '{}' output: {}", COMMAND, output.trim());
                    exec_errors += ctx.unreadable(&result, lnn, text);
                }
            }
        }

        Ok((exec_errors, th_errors).into())
    }
}
