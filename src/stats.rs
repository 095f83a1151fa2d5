use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::ClassifiedAttributes;

/// Counters for one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parsed: usize,
    pub skipped: usize,
    pub posted: usize,
    /// Winning label → number of servers it won for.
    pub attribute_counts: BTreeMap<String, usize>,
    pub errors: Vec<String>,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            parsed: 0,
            skipped: 0,
            posted: 0,
            attribute_counts: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).to_std().unwrap_or_default()
    }

    pub fn record_attributes(&mut self, attrs: &ClassifiedAttributes) {
        for (_, label) in attrs.winners() {
            *self.attribute_counts.entry(label.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_error(&mut self, message: String) {
        self.errors.push(message);
    }
}

/// Receives the final stats of a run.
pub trait Reporter {
    fn report(&self, stats: &RunStats);
}

impl<R: Reporter + ?Sized> Reporter for &R {
    fn report(&self, stats: &RunStats) {
        (**self).report(stats)
    }
}

impl<A: Reporter, B: Reporter> Reporter for (A, B) {
    fn report(&self, stats: &RunStats) {
        self.0.report(stats);
        self.1.report(stats);
    }
}

/// Writes the run summary to the log.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, stats: &RunStats) {
        info!(
            parsed = stats.parsed,
            skipped = stats.skipped,
            posted = stats.posted,
            duration = %format_duration(stats.duration()),
            "Scraper run finished"
        );
        let histogram = stats
            .attribute_counts
            .iter()
            .map(|(label, n)| format!("{}={}", label, n))
            .collect::<Vec<_>>()
            .join(", ");
        if !histogram.is_empty() {
            info!("Attribute stats: {}", histogram);
        }
        for err in &stats.errors {
            warn!("Run error: {}", err);
        }
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::classify::classify;

    struct Capture(RefCell<Vec<usize>>);

    impl Reporter for Capture {
        fn report(&self, stats: &RunStats) {
            self.0.borrow_mut().push(stats.posted);
        }
    }

    #[test]
    fn histogram_counts_winners() {
        let mut stats = RunStats::start();
        stats.record_attributes(&classify("2x monthly solo", ""));
        stats.record_attributes(&classify("2x weekly", ""));
        assert_eq!(stats.attribute_counts.get("2x"), Some(&2));
        assert_eq!(stats.attribute_counts.get("monthly"), Some(&1));
        assert_eq!(stats.attribute_counts.get("pvp"), Some(&2));
        assert_eq!(stats.attribute_counts.get("no limit"), Some(&1));
        assert_eq!(stats.attribute_counts.get("solo"), Some(&1));
    }

    #[test]
    fn pair_reports_to_both() {
        let a = Capture(RefCell::new(Vec::new()));
        let b = Capture(RefCell::new(Vec::new()));
        let mut stats = RunStats::start();
        stats.posted = 3;
        (&a, &b).report(&stats);
        assert_eq!(*a.0.borrow(), vec![3]);
        assert_eq!(*b.0.borrow(), vec![3]);
    }

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_secs(5)), "0h 0m 5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
