//! Open file handle check.

use super::leak::{track, Reading};
use super::{Check, CheckContext};
use crate::models::{CheckOutcome, Severity};
use crate::trend::parse_numeric;
use anyhow::Result;
use async_trait::async_trait;

const COMMAND: &str = "sysctl -n kern.openfiles kern.maxfiles";
const FAMILY: &str = "fstat";
const LABEL: &str = "open_files";

/// `(open, max)` from the two-line sysctl output.
pub fn parse_counts(output: &str) -> Option<(f64, f64)> {
    let mut values = output.lines().filter_map(parse_numeric);
    let open = values.next()?;
    let max = values.next()?;
    (max > 0.0).then_some((open, max))
}

/// Fails nodes close to their file handle limit and tracks open handles
/// for leaks.
pub struct FileHandleCheck;

#[async_trait]
impl Check for FileHandleCheck {
    fn name(&self) -> &'static str {
        "filehandles"
    }

    fn description(&self) -> &'static str {
        "open file handles against the kernel limit, with leak tracking"
    }

    async fn run(&self, ctx: &mut CheckContext<'_>) -> Result<CheckOutcome> {
        let result = ctx.fan_out(COMMAND, false).await;
        let mut exec_errors = result.execution_errors();
        let mut th_errors = 0;
        let max_ratio = ctx.thresholds.max_filehandle_ratio;

        let mut readings = Vec::new();
        for lnn in ctx.snapshot.online() {
            let output = result.output(lnn);
            let Some((open, max)) = parse_counts(output) else {
                let text = format!("unexpected '{}' output: {}", COMMAND, output.trim());
                exec_errors += ctx.unreadable(&result, lnn, text);
                continue;
            };

            let ratio = open / max;
            if ratio > max_ratio {
                th_errors += 1;
                ctx.record(
                    Some(lnn),
                    Severity::Fail,
                    format!(
                        "{} of {} file handles in use ({:.1}% > {:.1}%)",
                        open,
                        max,
                        ratio * 100.0,
                        max_ratio * 100.0
                    ),
                );
            } else {
                ctx.record(
                    Some(lnn),
                    Severity::Pass,
                    format!("{} of {} file handles in use", open, max),
                );
            }
            readings.push(Reading { lnn, value: open });
        }

        let leaks = track(ctx, FAMILY, LABEL, "files", &readings)?;
        Ok((exec_errors, th_errors, leaks).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::tests::Harness;
    use crate::fanout::executor::tests::FakeRemote;
    use crate::models::Lnn;
    use std::sync::Arc;

    #[test]
    fn test_parse_counts() {
        assert_eq!(parse_counts("120\n1000\n"), Some((120.0, 1000.0)));
        assert_eq!(parse_counts("120\n0\n"), None);
        assert_eq!(parse_counts("120\n"), None);
    }

    #[tokio::test]
    async fn test_ratio_threshold() {
        let remote = FakeRemote::new(|_, target| {
            let mut out = crate::shell::CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            };
            for lnn in target.covers(&[Lnn(1), Lnn(2), Lnn(3)]) {
                let open = if lnn == Lnn(1) { 950 } else { 100 };
                out.stdout.push_str(&format!("tc-{}: {}\ntc-{}: 1000\n", lnn, open, lnn));
            }
            out
        });
        let mut harness = Harness::new(Arc::new(remote));

        let outcome = FileHandleCheck.run(&mut harness.ctx()).await.unwrap();

        assert_eq!(outcome, CheckOutcome::from((0, 1, 0)));
        assert_eq!(harness.texts(Lnn(1), Severity::Fail).len(), 1);
        assert_eq!(
            harness.texts(Lnn(2), Severity::Pass),
            vec!["100 of 1000 file handles in use"]
        );
    }
}
