//! Short-horizon linear trend forecast over a stream's recent values.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Fewer points than this and the trend is noise.
pub const MIN_POINTS: usize = 50;
const HISTORY: usize = 100;
const TREND_POINTS: usize = 10;
const SPREAD_POINTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub at: DateTime<Utc>,
    pub predicted: f64,
    pub lower: f64,
    pub upper: f64,
    /// `tanh(|z| / 3)` of the prediction against recent history, in `[0, 1)`.
    pub anomaly_score: f64,
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Population standard deviation.
fn std_dev(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    let m = mean(xs);
    (xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / xs.len() as f64).sqrt()
}

fn tail(xs: &[f64], n: usize) -> &[f64] {
    &xs[xs.len().saturating_sub(n)..]
}

/// Extrapolate `horizon` steps past `last_at`, one every `step`.
///
/// The slope is the mean of the last ten deltas, the band is +/- two
/// standard deviations of the last twenty values.
pub fn forecast(
    values: &[f64],
    last_at: DateTime<Utc>,
    step: Duration,
    horizon: u32,
) -> Vec<ForecastPoint> {
    if values.len() < MIN_POINTS {
        return Vec::new();
    }
    let recent = tail(values, HISTORY);
    let trend_window = tail(recent, TREND_POINTS + 1);
    let deltas: Vec<f64> = trend_window.windows(2).map(|w| w[1] - w[0]).collect();
    let trend = mean(&deltas);
    let spread = 2.0 * std_dev(tail(recent, SPREAD_POINTS));

    let history_mean = mean(recent);
    let history_std = std_dev(recent);
    let last = recent[recent.len() - 1];

    (1..=horizon)
        .map(|h| {
            let predicted = last + trend * h as f64;
            let z = (predicted - history_mean).abs() / (history_std + 1e-8);
            ForecastPoint {
                at: last_at + step * h as i32,
                predicted,
                lower: predicted - spread,
                upper: predicted + spread,
                anomaly_score: (z / 3.0).tanh(),
            }
        })
        .collect()
}
