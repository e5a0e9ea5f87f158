//! Events reported to whoever drives a run

use tokio::sync::mpsc;
use tracing::info;

use super::stats::RunSummary;
use super::RunPhase;

/// Extraction event types
#[derive(Debug, Clone)]
pub enum ExtractionEvent {
    /// Human-readable log line
    Log(String),
    /// Percent of fetched emails handled so far
    Progress(u8),
    /// The run entered a new phase
    Phase(RunPhase),
    /// Final statistics of a successful run
    Summary(RunSummary),
}

/// Sending side of the event channel.
///
/// Sending never blocks, so events can be emitted while a sync lock is held.
/// A dropped receiver only loses events; the run carries on.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ExtractionEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExtractionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Log line, also written to the tracing log
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.send(ExtractionEvent::Log(message));
    }

    pub fn progress(&self, percent: u8) {
        self.send(ExtractionEvent::Progress(percent));
    }

    pub fn phase(&self, phase: RunPhase) {
        self.send(ExtractionEvent::Phase(phase));
    }

    pub fn summary(&self, summary: RunSummary) {
        self.send(ExtractionEvent::Summary(summary));
    }

    fn send(&self, event: ExtractionEvent) {
        let _ = self.tx.send(event);
    }
}
