//! Human-readable anomaly descriptions and operator recommendations.

use crate::detect::{ScoreResult, Severity};

/// Metric families we have canned wording for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricFamily {
    Cpu,
    Memory,
    Disk,
    Network,
    ResponseTime,
    Other,
}

impl MetricFamily {
    /// Classify a metric name by substring, so `CPUUtilization`,
    /// `node_cpu_seconds` and `Percentage CPU` all land on `Cpu`.
    pub fn of(metric_name: &str) -> Self {
        let m = metric_name.to_ascii_lowercase();
        if m.contains("cpu") {
            MetricFamily::Cpu
        } else if m.contains("mem") {
            MetricFamily::Memory
        } else if m.contains("disk") || m.contains("filesystem") || m.contains("storage") {
            MetricFamily::Disk
        } else if m.contains("network") || m.contains("net_") || m.contains("bytes_in") || m.contains("bytes_out") {
            MetricFamily::Network
        } else if m.contains("latency") || m.contains("response") || m.contains("duration") {
            MetricFamily::ResponseTime
        } else {
            MetricFamily::Other
        }
    }
}

pub fn describe(metric_name: &str, value: f64, result: &ScoreResult) -> String {
    let direction = if result.score >= 0.0 { "above" } else { "below" };
    let head = match MetricFamily::of(metric_name) {
        MetricFamily::Cpu => format!("CPU usage anomaly: {:.1}%", value),
        MetricFamily::Memory => format!("Memory usage anomaly: {:.1}%", value),
        MetricFamily::Disk => format!("Disk usage anomaly: {:.1}%", value),
        MetricFamily::Network => format!("Network I/O anomaly: {:.1} MB/s", value),
        MetricFamily::ResponseTime => format!("Response time anomaly: {:.1}ms", value),
        MetricFamily::Other => format!("Anomaly in {}: {}", metric_name, value),
    };
    format!(
        "{} ({:.1} sigma {} baseline {:.2} +/- {:.2}, confidence {:.2})",
        head,
        result.score.abs(),
        direction,
        result.baseline_mean,
        result.baseline_stddev,
        result.confidence
    )
}

pub fn recommendations(metric_name: &str, severity: Severity) -> Vec<String> {
    let base: &[&str] = match MetricFamily::of(metric_name) {
        MetricFamily::Cpu => &[
            "Check for runaway processes",
            "Consider scaling up instances",
            "Review recent deployments",
        ],
        MetricFamily::Memory => &[
            "Check for memory leaks",
            "Review application memory usage",
            "Restart affected services if necessary",
        ],
        MetricFamily::Disk => &[
            "Clean up temporary files",
            "Archive old logs",
            "Consider adding storage capacity",
        ],
        MetricFamily::Network => &[
            "Check network connectivity",
            "Review bandwidth usage",
            "Verify load balancer configuration",
        ],
        MetricFamily::ResponseTime => &[
            "Check database performance",
            "Monitor external dependencies",
            "Review application logs",
        ],
        MetricFamily::Other => &["Investigate the anomaly"],
    };
    let mut out = Vec::with_capacity(base.len() + 1);
    if severity == Severity::Critical {
        out.push("IMMEDIATE ACTION REQUIRED".to_string());
    }
    out.extend(base.iter().map(|s| s.to_string()));
    out
}
