use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

/// Rolling windows of transient-sim run times, summarized over the last 1,
/// 60, and 1440 runs.
pub struct SimTimers {
    samples: Mutex<VecDeque<Duration>>,
}

const WINDOWS: [usize; 3] = [1, 60, 1440];

impl SimTimers {
    pub fn new() -> SimTimers {
        SimTimers {
            samples: Mutex::new(VecDeque::with_capacity(WINDOWS[2])),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == WINDOWS[2] {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn snapshot(&self) -> Value {
        let samples = self.samples.lock();
        let mut out = serde_json::Map::new();
        for window in WINDOWS {
            let taken: Vec<f64> = samples
                .iter()
                .rev()
                .take(window)
                .map(|d| d.as_secs_f64())
                .collect();
            let count = taken.len();
            let (mean, max) = if count == 0 {
                (0.0, 0.0)
            } else {
                (
                    taken.iter().sum::<f64>() / count as f64,
                    taken.iter().cloned().fold(0.0, f64::max),
                )
            };
            out.insert(
                format!("sim{window}"),
                json!({"count": count, "mean": mean, "max": max}),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_summarize_recent_runs() {
        let timers = SimTimers::new();
        for secs in [2, 4, 6] {
            timers.observe(Duration::from_secs(secs));
        }
        let snap = timers.snapshot();
        assert_eq!(snap["sim1"]["count"], 1);
        assert_eq!(snap["sim1"]["mean"], 6.0);
        assert_eq!(snap["sim60"]["count"], 3);
        assert_eq!(snap["sim60"]["mean"], 4.0);
        assert_eq!(snap["sim60"]["max"], 6.0);
    }
}
