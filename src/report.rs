//! Run report: decoded statistics plus per-dispatch timing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::accel::Backend;

/// Execution time of one dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: String,
    pub backend: Backend,
    pub duration_us: u64,
}

/// Aggregate statistics for one pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub backend: Backend,
    pub device: String,
    pub count: usize,
    pub padded_count: usize,
    pub local_size: usize,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub mean: f64,
    pub variance: f64, // Population variance
    pub stdev: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomic_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atomic_max: Option<f64>,
    pub timings: Vec<StageTiming>,
}

impl Report {
    pub fn total_device_us(&self) -> u64 {
        self.timings.iter().map(|t| t.duration_us).sum()
    }
}

/// Format a report as a human-readable summary.
pub fn format_summary(report: &Report) -> String {
    let mut out = format!(
        "{} value{} on {} ({}), work-group {}, padded to {}\n",
        report.count,
        if report.count == 1 { "" } else { "s" },
        report.device,
        report.backend,
        report.local_size,
        report.padded_count,
    );

    out.push_str(&format!("{:<10} | {:>14}\n", "Statistic", "Value"));
    out.push_str(&format!("{:-<10}-|-{:->14}\n", "", ""));
    for (name, value) in [
        ("min", report.min),
        ("max", report.max),
        ("sum", report.sum),
        ("mean", report.mean),
        ("variance", report.variance),
        ("stdev", report.stdev),
    ] {
        out.push_str(&format!("{:<10} | {:>14.4}\n", name, value));
    }
    if let Some(v) = report.atomic_min {
        out.push_str(&format!("{:<10} | {:>14.4}\n", "atomic min", v));
    }
    if let Some(v) = report.atomic_max {
        out.push_str(&format!("{:<10} | {:>14.4}\n", "atomic max", v));
    }

    out.push_str(&format!("\n{:<18} | {:>10}\n", "Dispatch", "Time (us)"));
    out.push_str(&format!("{:-<18}-|-{:->10}\n", "", ""));
    for timing in &report.timings {
        out.push_str(&format!("{:<18} | {:>10}\n", timing.stage, timing.duration_us));
    }
    out.push_str(&format!("{:<18} | {:>10}\n", "total", report.total_device_us()));

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Report {
        Report {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            backend: Backend::Emulated,
            device: "Emulated device (8 threads)".to_string(),
            count: 10,
            padded_count: 10,
            local_size: 10,
            min: 2.0,
            max: 35.0,
            sum: 89.0,
            mean: 8.9,
            variance: 81.69,
            stdev: 81.69f64.sqrt(),
            atomic_min: None,
            atomic_max: None,
            timings: vec![
                StageTiming {
                    stage: "min".to_string(),
                    backend: Backend::Emulated,
                    duration_us: 12,
                },
                StageTiming {
                    stage: "sum".to_string(),
                    backend: Backend::Emulated,
                    duration_us: 30,
                },
            ],
        }
    }

    #[test]
    fn test_format_summary() {
        let summary = format_summary(&sample());
        assert!(summary.contains("10 values on Emulated device"));
        assert!(summary.contains("8.9000"));
        assert!(summary.contains("81.6900"));
        assert!(!summary.contains("atomic"));
        assert!(summary.contains("total"));
    }

    #[test]
    fn test_json_omits_absent_atomic() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["backend"], "emulated");
        assert_eq!(json["min"], 2.0);
        assert!(json.get("atomic_min").is_none());
        assert_eq!(json["timings"][1]["duration_us"], 30);
    }

    #[test]
    fn test_total_device_time() {
        assert_eq!(sample().total_device_us(), 42);
    }
}
