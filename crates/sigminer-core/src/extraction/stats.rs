//! Per-run counters and the summary emitted at the end of a run

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::events::EventSink;
use crate::models::FieldConfig;

/// Counters for one configured field
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSummary {
    pub field_name: String,
    /// Extractions that returned an answer
    pub attempted: usize,
    /// Answers with a usable value
    pub non_null: usize,
    /// USD
    pub cost: f64,
}

/// Statistics of a finished run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub emails_fetched: usize,
    /// No sender address, or filtered out by host
    pub emails_skipped: usize,
    pub contacts_processed: usize,
    pub fields_processed: usize,
    pub total_cost: f64,
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    /// In configured field order
    pub fields: Vec<FieldSummary>,
}

impl RunSummary {
    pub fn average_time_per_email(&self) -> Duration {
        if self.contacts_processed == 0 {
            return Duration::ZERO;
        }
        self.total_time / self.contacts_processed as u32
    }

    pub fn average_cost_per_email(&self) -> f64 {
        if self.contacts_processed == 0 {
            return 0.0;
        }
        self.total_cost / self.contacts_processed as f64
    }

    pub fn field(&self, name: &str) -> Option<&FieldSummary> {
        self.fields.iter().find(|f| f.field_name == name)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Extraction statistics (run {})", self.run_id)?;
        writeln!(
            f,
            "Emails: {} fetched, {} processed, {} skipped",
            self.emails_fetched, self.contacts_processed, self.emails_skipped
        )?;
        writeln!(f, "Fields processed: {}", self.fields_processed)?;
        writeln!(f, "Total cost: ${:.4}", self.total_cost)?;
        writeln!(f, "Total time: {:.2}s", self.total_time.as_secs_f64())?;
        writeln!(
            f,
            "Average per email: {:.2}s, ${:.4}",
            self.average_time_per_email().as_secs_f64(),
            self.average_cost_per_email()
        )?;
        for field in &self.fields {
            write!(
                f,
                "\n  {}: {}/{} non-null, ${:.4}",
                field.field_name, field.non_null, field.attempted, field.cost
            )?;
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

#[derive(Debug, Default)]
struct Counters {
    emails_done: usize,
    emails_skipped: usize,
    contacts_processed: usize,
    fields_processed: usize,
    total_cost: f64,
    fields: Vec<FieldSummary>,
    last_progress: Option<u8>,
}

/// Shared counters for one run.
///
/// Progress is computed and emitted while the counter lock is held, so
/// concurrent tasks can never emit a smaller value after a larger one.
pub struct RunStatistics {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    emails_fetched: usize,
    counters: Mutex<Counters>,
    events: EventSink,
}

impl RunStatistics {
    pub fn new(run_id: Uuid, emails_fetched: usize, fields: &[FieldConfig], events: EventSink) -> Self {
        let counters = Counters {
            fields: fields
                .iter()
                .map(|f| FieldSummary {
                    field_name: f.field_name.clone(),
                    attempted: 0,
                    non_null: 0,
                    cost: 0.0,
                })
                .collect(),
            ..Counters::default()
        };

        Self {
            run_id,
            started_at: Utc::now(),
            emails_fetched,
            counters: Mutex::new(counters),
            events,
        }
    }

    /// Count one answered extraction
    pub fn record_field(&self, field_name: &str, cost: f64, non_null: bool) {
        let mut counters = self.counters.lock();
        counters.fields_processed += 1;
        counters.total_cost += cost;
        if let Some(field) = counters.fields.iter_mut().find(|f| f.field_name == field_name) {
            field.attempted += 1;
            field.cost += cost;
            if non_null {
                field.non_null += 1;
            }
        }
    }

    /// An email went through extraction
    pub fn email_processed(&self) {
        let mut counters = self.counters.lock();
        counters.contacts_processed += 1;
        self.advance(&mut counters);
    }

    /// An email was skipped before extraction
    pub fn email_skipped(&self) {
        let mut counters = self.counters.lock();
        counters.emails_skipped += 1;
        self.advance(&mut counters);
    }

    /// Emit 100 if it has not been emitted yet (no emails at all)
    pub fn finish(&self) {
        let mut counters = self.counters.lock();
        if counters.last_progress != Some(100) {
            counters.last_progress = Some(100);
            self.events.progress(100);
        }
    }

    fn advance(&self, counters: &mut Counters) {
        counters.emails_done += 1;
        let percent = if self.emails_fetched == 0 {
            100
        } else {
            (counters.emails_done.min(self.emails_fetched) * 100 / self.emails_fetched) as u8
        };
        if counters.last_progress.map_or(true, |last| percent > last) {
            counters.last_progress = Some(percent);
            self.events.progress(percent);
        }
    }

    pub fn summary(&self, total_time: Duration) -> RunSummary {
        let counters = self.counters.lock();
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            emails_fetched: self.emails_fetched,
            emails_skipped: counters.emails_skipped,
            contacts_processed: counters.contacts_processed,
            fields_processed: counters.fields_processed,
            total_cost: counters.total_cost,
            total_time,
            fields: counters.fields.clone(),
        }
    }
}
