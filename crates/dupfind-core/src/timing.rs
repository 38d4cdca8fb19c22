use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tracing::debug;

/// Wall-clock time spent in one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub name: String,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

/// Per-run stage timings, in the order stages ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    pub stages: Vec<StageTiming>,
}

/// Returns true when `DUPFIND_TIMING` asks for a timing report.
///
/// Supported truthy values: `1`, `true`, `yes`, `on` (case-insensitive).
#[must_use]
pub fn timing_enabled_from_env() -> bool {
    std::env::var("DUPFIND_TIMING")
        .ok()
        .is_some_and(|value| is_truthy(value.as_str()))
}

impl StageTimings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f`, recording its duration under `name`.
    pub fn timed<R>(&mut self, name: &str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        let elapsed = started.elapsed();
        debug!(stage = name, elapsed_ms = duration_ms(elapsed), "stage finished");
        self.stages.push(StageTiming {
            name: name.to_string(),
            elapsed,
        });
        result
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Duration> {
        self.stages
            .iter()
            .find(|stage| stage.name == name)
            .map(|stage| stage.elapsed)
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.stages.iter().map(|stage| stage.elapsed).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Render a fixed-width table.
    #[must_use]
    pub fn display_table(&self) -> String {
        let name_width = self
            .stages
            .iter()
            .map(|stage| stage.name.len())
            .max()
            .unwrap_or(5)
            .max("stage".len());

        let mut out = String::new();
        let _ = writeln!(out, "{:<name_width$}  {:>10}", "stage", "ms");
        for stage in &self.stages {
            let _ = writeln!(
                out,
                "{:<name_width$}  {:>10.1}",
                stage.name,
                duration_ms(stage.elapsed)
            );
        }
        let _ = write!(
            out,
            "{:<name_width$}  {:>10.1}",
            "total",
            duration_ms(self.total())
        );
        out
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "stages": self.stages.iter().map(|stage| json!({
                "name": stage.name,
                "elapsed_ms": duration_ms(stage.elapsed),
            })).collect::<Vec<_>>(),
            "total_ms": duration_ms(self.total()),
        })
    }
}

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(duration_ms(*duration))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_records_in_order_and_returns_value() {
        let mut timings = StageTimings::new();
        let a = timings.timed("load", || 1 + 1);
        let b = timings.timed("index", || "done");

        assert_eq!(a, 2);
        assert_eq!(b, "done");
        let names: Vec<_> = timings.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["load", "index"]);
        assert!(timings.get("index").is_some());
        assert!(timings.get("missing").is_none());
    }

    #[test]
    fn table_lists_every_stage_and_total() {
        let timings = StageTimings {
            stages: vec![
                StageTiming {
                    name: "buckets".into(),
                    elapsed: Duration::from_millis(12),
                },
                StageTiming {
                    name: "train-inference".into(),
                    elapsed: Duration::from_millis(30),
                },
            ],
        };
        let table = timings.display_table();
        assert!(table.contains("buckets"));
        assert!(table.contains("train-inference"));
        assert!(table.contains("total"));
        assert!(table.contains("42.0"));
        let total_ms = timings.to_json()["total_ms"].as_f64().expect("number");
        assert!((total_ms - 42.0).abs() < 1e-6);
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", "YES", " on "] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["0", "false", "", "nope"] {
            assert!(!is_truthy(value), "{value}");
        }
    }
}
