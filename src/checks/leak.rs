//! Trend tracking shared by the leak-class checks.

use super::CheckContext;
use crate::models::{LeakClass, Lnn, Severity, TrendResult, TrendSample};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A value sampled on one node this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub lnn: Lnn,
    pub value: f64,
}

fn describe(label: &str, unit: &str, fit: &TrendResult) -> String {
    format!(
        "{} trend of {:.7} {}/sec (r={:.7}, intercept {:.7}) over {} samples",
        label, fit.slope, unit, fit.correlation, fit.intercept, fit.samples
    )
}

/// Append this cycle's readings to the `family` store, then classify the
/// series of every node that got a reading.
///
/// Leaks become `CurrentLeak` or `PastLeak` events on their node. Returns
/// the number of leaks found.
pub fn track(
    ctx: &mut CheckContext<'_>,
    family: &str,
    label: &str,
    unit: &str,
    readings: &[Reading],
) -> Result<u32> {
    if readings.is_empty() {
        return Ok(0);
    }

    let samples: Vec<TrendSample> = readings
        .iter()
        .map(|r| TrendSample {
            timestamp: ctx.timestamp,
            lnn: r.lnn,
            label: label.to_string(),
            value: r.value,
            unit: unit.to_string(),
        })
        .collect();

    let mut series: BTreeMap<Lnn, Vec<(f64, f64)>> = BTreeMap::new();
    {
        let store = ctx.trend_stores.get(family)?;
        store.append(&samples)?;
        let wanted: BTreeSet<Lnn> = readings.iter().map(|r| r.lnn).collect();
        for sample in store.load()? {
            if sample.label == label && wanted.contains(&sample.lnn) {
                series
                    .entry(sample.lnn)
                    .or_default()
                    .push((sample.timestamp as f64, sample.value));
            }
        }
    }

    let mut leaks = 0;
    for (lnn, points) in series {
        let fit = ctx.analyzer.classify(&points);
        debug!(
            "{} node {}: {} ({} samples)",
            family, lnn, fit.classification, fit.samples
        );
        match fit.classification {
            LeakClass::CurrentLeak => {
                leaks += 1;
                ctx.record(Some(lnn), Severity::CurrentLeak, describe(label, unit, &fit));
            }
            LeakClass::PastLeak => {
                leaks += 1;
                ctx.record(
                    Some(lnn),
                    Severity::PastLeak,
                    format!("{} (since stabilized)", describe(label, unit, &fit)),
                );
            }
            LeakClass::NoTrend => {}
        }
    }
    Ok(leaks)
}
