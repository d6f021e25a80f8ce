//! Trend analysis for slow resource leaks.
//!
//! Fits an ordinary least-squares line through a series of
//! `(timestamp, value)` samples and classifies the series:
//! - `CurrentLeak` when the most recent window shows a steep, well
//!   correlated trend
//! - `PastLeak` when only an older window does (the metric has since
//!   stabilized)
//! - `NoTrend` otherwise, including every degenerate fit

pub mod store;

pub use store::{TrendStore, TrendStores};

use crate::config::TrendConfig;
use crate::models::{LeakClass, TrendResult};
use regex::Regex;
use std::sync::OnceLock;

fn numeric_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]+\.*[0-9]*$").expect("valid numeric regex"))
}

/// Parse a free-text sample value. Only unsigned decimal numbers count;
/// anything else (units, dashes, error text) is not a sample.
pub fn parse_numeric(text: &str) -> Option<f64> {
    let text = text.trim();
    if !numeric_regex().is_match(text) {
        return None;
    }
    // "12..5" passes the shape check but is not a number.
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Leak thresholds, all externally configured.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendAnalyzer {
    pub min_slope: f64,
    pub min_correlation: f64,
    pub min_samples: usize,
    pub max_samples: usize,
    /// Newest samples left out of the older window.
    pub settle_samples: usize,
}

impl From<&TrendConfig> for TrendAnalyzer {
    fn from(config: &TrendConfig) -> Self {
        Self {
            min_slope: config.min_slope,
            min_correlation: config.min_correlation,
            min_samples: config.min_samples,
            max_samples: config.max_samples,
            settle_samples: config.settle_samples.unwrap_or(config.min_samples),
        }
    }
}

/// Five running sums of a fit, over values shifted to the first sample.
#[derive(Debug, Default)]
struct Sums {
    n: f64,
    x: f64,
    x2: f64,
    xy: f64,
    y: f64,
    y2: f64,
}

impl TrendAnalyzer {
    /// Fit a line through `samples` and classify that single window.
    ///
    /// Non-finite samples are skipped. Degenerate input (fewer than two
    /// valid samples, zero variance in either variable) yields the zero
    /// fit with `NoTrend` instead of an error.
    pub fn fit(&self, samples: &[(f64, f64)]) -> TrendResult {
        let valid: Vec<(f64, f64)> = samples
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        let count = valid.len();
        let Some(&(x0, y0)) = valid.first() else {
            return TrendResult::none(0);
        };

        // Shifting both axes keeps the sums small for epoch timestamps;
        // slope and correlation are unaffected.
        let mut s = Sums::default();
        for (x, y) in &valid {
            let (x, y) = (x - x0, y - y0);
            s.n += 1.0;
            s.x += x;
            s.x2 += x * x;
            s.xy += x * y;
            s.y += y;
            s.y2 += y * y;
        }

        let x_var = s.n * s.x2 - s.x * s.x;
        let y_var = s.n * s.y2 - s.y * s.y;
        if x_var <= f64::EPSILON * s.n * s.x2 || y_var <= f64::EPSILON * s.n * s.y2 {
            return TrendResult::none(count);
        }

        let variance_product = (s.x2 - s.x * s.x / s.n) * (s.y2 - s.y * s.y / s.n);
        if variance_product <= 0.0 {
            return TrendResult::none(count);
        }

        let slope = (s.n * s.xy - s.x * s.y) / x_var;
        let shifted_intercept = (s.y * s.x2 - s.x * s.xy) / x_var;
        let intercept = shifted_intercept + y0 - slope * x0;
        let correlation = (s.xy - s.x * s.y / s.n) / variance_product.sqrt();

        let mut result = TrendResult {
            slope,
            intercept,
            correlation,
            samples: count,
            classification: LeakClass::NoTrend,
        };
        if self.is_leak(&result) {
            result.classification = LeakClass::CurrentLeak;
        }
        result
    }

    /// Whether a fit passes every leak threshold.
    pub fn is_leak(&self, fit: &TrendResult) -> bool {
        fit.samples >= self.min_samples
            && fit.samples >= 2
            && fit.slope.abs() >= self.min_slope
            && fit.correlation.abs() >= self.min_correlation
    }

    /// Classify a whole series, oldest sample first.
    ///
    /// The recent window is the newest `max_samples` samples. The older
    /// window drops the newest `settle_samples` first, then takes the
    /// newest `max_samples` of what remains.
    pub fn classify(&self, series: &[(f64, f64)]) -> TrendResult {
        let valid: Vec<(f64, f64)> = series
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();

        let recent = self.fit(tail(&valid, self.max_samples));
        if recent.classification == LeakClass::CurrentLeak {
            return recent;
        }

        if self.settle_samples > 0 && valid.len() > self.settle_samples {
            let settled = &valid[..valid.len() - self.settle_samples];
            let older = self.fit(tail(settled, self.max_samples));
            if older.classification == LeakClass::CurrentLeak {
                return TrendResult {
                    classification: LeakClass::PastLeak,
                    ..older
                };
            }
        }

        TrendResult {
            classification: LeakClass::NoTrend,
            ..recent
        }
    }
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer(min_samples: usize, max_samples: usize) -> TrendAnalyzer {
        TrendAnalyzer {
            min_slope: 0.5,
            min_correlation: 0.9,
            min_samples,
            max_samples,
            settle_samples: min_samples,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric("42"), Some(42.0));
        assert_eq!(parse_numeric(" 3.5 \n"), Some(3.5));
        assert_eq!(parse_numeric("7."), Some(7.0));
        assert_eq!(parse_numeric("-1"), None);
        assert_eq!(parse_numeric("12 KB"), None);
        assert_eq!(parse_numeric("1..2"), None);
        assert_eq!(parse_numeric(""), None);
    }

    #[test]
    fn test_fit_linear_series() {
        let samples: Vec<(f64, f64)> = (0..10).map(|x| (x as f64, 2.0 * x as f64 + 3.0)).collect();
        let fit = analyzer(3, 288).fit(&samples);

        assert_close(fit.slope, 2.0);
        assert_close(fit.intercept, 3.0);
        assert_close(fit.correlation, 1.0);
        assert_eq!(fit.samples, 10);
        assert_eq!(fit.classification, LeakClass::CurrentLeak);
    }

    #[test]
    fn test_fit_with_epoch_timestamps() {
        let base = 1_700_000_000.0;
        let samples: Vec<(f64, f64)> = (0..100)
            .map(|i| (base + 300.0 * i as f64, 1000.0 - 0.01 * 300.0 * i as f64))
            .collect();
        let fit = analyzer(3, 288).fit(&samples);

        assert_close(fit.slope, -0.01);
        assert_close(fit.correlation, -1.0);
        assert!((fit.intercept - (1000.0 + 0.01 * base)).abs() < 1e-3);
    }

    #[test]
    fn test_constant_series_is_no_trend() {
        let flat_y: Vec<(f64, f64)> = (0..30).map(|x| (x as f64, 5.0)).collect();
        let fit = analyzer(3, 288).fit(&flat_y);
        assert_eq!(fit.classification, LeakClass::NoTrend);
        assert_eq!(fit.slope, 0.0);
        assert_eq!(fit.correlation, 0.0);

        let flat_x: Vec<(f64, f64)> = (0..30).map(|y| (7.0, y as f64)).collect();
        assert_eq!(analyzer(3, 288).fit(&flat_x).classification, LeakClass::NoTrend);

        assert_eq!(analyzer(3, 288).fit(&[]).classification, LeakClass::NoTrend);
        assert_eq!(analyzer(1, 288).fit(&[(1.0, 1.0)]).classification, LeakClass::NoTrend);
    }

    #[test]
    fn test_non_finite_samples_are_skipped() {
        let samples = vec![(0.0, 3.0), (1.0, f64::NAN), (2.0, 7.0), (f64::INFINITY, 1.0), (3.0, 9.0)];
        let fit = analyzer(3, 288).fit(&samples);
        assert_eq!(fit.samples, 3);
        assert_close(fit.slope, 2.0);
    }

    #[test]
    fn test_too_few_samples_is_not_a_leak() {
        let samples: Vec<(f64, f64)> = (0..5).map(|x| (x as f64, 2.0 * x as f64)).collect();
        let fit = analyzer(20, 288).fit(&samples);
        assert_close(fit.slope, 2.0);
        assert_eq!(fit.classification, LeakClass::NoTrend);
    }

    #[test]
    fn test_classify_current_leak() {
        let series: Vec<(f64, f64)> = (0..40).map(|x| (x as f64, x as f64)).collect();
        let result = analyzer(10, 30).classify(&series);
        assert_eq!(result.classification, LeakClass::CurrentLeak);
        assert_eq!(result.samples, 30);
    }

    #[test]
    fn test_classify_past_leak() {
        // Rises for 40 samples, then stays flat for 20.
        let series: Vec<(f64, f64)> = (0..60)
            .map(|x| (x as f64, if x < 40 { x as f64 } else { 40.0 }))
            .collect();
        let mut analyzer = analyzer(10, 20);
        analyzer.settle_samples = 20;
        let result = analyzer.classify(&series);
        assert_eq!(result.classification, LeakClass::PastLeak);
    }

    #[test]
    fn test_classify_noise_is_no_trend() {
        let series: Vec<(f64, f64)> = (0..50)
            .map(|x| (x as f64, if x % 2 == 0 { 10.0 } else { 20.0 }))
            .collect();
        assert_eq!(analyzer(10, 288).classify(&series).classification, LeakClass::NoTrend);
    }
}
