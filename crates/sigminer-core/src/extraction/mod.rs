//! Extraction run orchestration
//!
//! A run loads the existing contact list, fetches emails, asks the extractor
//! for every field each sender still needs and rewrites the contact list.

mod events;
mod stats;

pub use events::*;
pub use stats::*;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use futures::stream::{self, TryStreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::llm::{prompt, Extraction, ExtractionRequest, FieldExtractor};
use crate::mail::{extract_content_ids, Mailbox};
use crate::models::{BodyType, Email, FieldConfig, LauncherConfig};
use crate::rate_limiter::RequestGate;
use crate::store::ContactStore;

/// Phase of an extraction run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    LoadingExistingContacts,
    FetchingEmails,
    ProcessingEmails,
    WritingOutput,
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::LoadingExistingContacts => "loading existing contacts",
            RunPhase::FetchingEmails => "fetching emails",
            RunPhase::ProcessingEmails => "processing emails",
            RunPhase::WritingOutput => "writing output",
            RunPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Runs extractions against one mailbox and one extractor
pub struct ExtractionRunner {
    mailbox: Arc<dyn Mailbox>,
    extractor: Arc<dyn FieldExtractor>,
    max_in_flight_requests: usize,
    rate_limit_per_second: u32,
    max_concurrent_emails: usize,
    phase: RwLock<RunPhase>,
    events: EventSink,
    event_rx: RwLock<Option<mpsc::UnboundedReceiver<ExtractionEvent>>>,
}

impl ExtractionRunner {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        extractor: Arc<dyn FieldExtractor>,
        settings: &Settings,
    ) -> Self {
        let (events, rx) = EventSink::channel();
        Self {
            mailbox,
            extractor,
            max_in_flight_requests: settings.max_in_flight_requests,
            rate_limit_per_second: settings.rate_limit_per_second,
            max_concurrent_emails: settings.max_concurrent_emails.max(1),
            phase: RwLock::new(RunPhase::Idle),
            events,
            event_rx: RwLock::new(Some(rx)),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ExtractionEvent>> {
        self.event_rx.write().take()
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.read()
    }

    fn set_phase(&self, phase: RunPhase) {
        *self.phase.write() = phase;
        debug!("Extraction phase: {}", phase);
        self.events.phase(phase);
    }

    /// Run one extraction.
    ///
    /// Cancelling `cancel` drops every in-flight request and returns
    /// [`Error::Cancelled`]; the destination file is only written once every
    /// email has been processed, so a cancelled or failed run leaves it as
    /// it was.
    pub async fn run(&self, config: &LauncherConfig, cancel: CancellationToken) -> Result<RunSummary> {
        config.validate()?;

        let run_id = Uuid::new_v4();
        info!("Starting extraction run {}", run_id);

        let gate = RequestGate::new(self.max_in_flight_requests, self.rate_limit_per_second);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                gate.close();
                Err(Error::Cancelled)
            }
            result = self.execute(run_id, config, &gate) => result,
        };

        if let Err(ref e) = result {
            if matches!(e, Error::Cancelled) {
                self.events.log(format!(
                    "Extraction cancelled, {} left unchanged",
                    config.file_path.display()
                ));
            } else {
                error!("Extraction run {} failed: {}", run_id, e);
                self.events.log(format!("Extraction failed: {}", e));
            }
            self.set_phase(RunPhase::Idle);
        }
        result
    }

    async fn execute(
        &self,
        run_id: Uuid,
        config: &LauncherConfig,
        gate: &RequestGate,
    ) -> Result<RunSummary> {
        let started = Instant::now();

        self.set_phase(RunPhase::LoadingExistingContacts);
        let store = ContactStore::load(&config.file_path);
        self.events.log(format!(
            "Loaded {} existing contacts from {}",
            store.len(),
            config.file_path.display()
        ));

        self.set_phase(RunPhase::FetchingEmails);
        match config.email_limit() {
            Some(max) => self.events.log(format!(
                "Starting email extraction. Maximum emails to process: {}.",
                max
            )),
            None => self
                .events
                .log("Starting email extraction. No maximum email limit set."),
        }
        let emails = self.mailbox.fetch_messages(config.email_limit()).await?;
        self.events.log(format!(
            "Email extraction completed. Total emails gathered: {}.",
            emails.len()
        ));

        self.set_phase(RunPhase::ProcessingEmails);
        let stats = RunStatistics::new(run_id, emails.len(), &config.fields, self.events.clone());
        {
            let (store, stats) = (&store, &stats);
            stream::iter(emails.into_iter().map(Ok::<_, Error>))
                .try_for_each_concurrent(self.max_concurrent_emails, move |email| {
                    self.process_email(email, config, gate, store, stats)
                })
                .await?;
        }
        stats.finish();

        self.set_phase(RunPhase::WritingOutput);
        let fieldnames = store.fieldnames(&config.field_names());
        store.write(&fieldnames).await?;
        self.events.log(format!(
            "Saved {} contacts to {}",
            store.len(),
            config.file_path.display()
        ));

        let summary = stats.summary(started.elapsed());
        self.events.log(summary.to_string());
        self.events.summary(summary.clone());
        self.set_phase(RunPhase::Done);
        Ok(summary)
    }

    async fn process_email(
        &self,
        mut email: Email,
        config: &LauncherConfig,
        gate: &RequestGate,
        store: &ContactStore,
        stats: &RunStatistics,
    ) -> Result<()> {
        let Some(address) = email.sender_address().map(str::to_string) else {
            self.events
                .log(format!("Skipping email {}: no sender address", email.id));
            stats.email_skipped();
            return Ok(());
        };

        let host = email.sender_host().unwrap_or_default();
        if config.skips_host(host) {
            self.events
                .log(format!("Skipping {}: host {} is filtered out", address, host));
            stats.email_skipped();
            return Ok(());
        }

        // Held until the email is done so same-sender emails apply in turn
        let entry = store.entry(&address);
        let mut contact = entry.lock().await;

        let needed: Vec<&FieldConfig> = config
            .fields
            .iter()
            .filter(|field| contact.needs_extraction(field))
            .collect();
        if needed.is_empty() {
            self.events
                .log(format!("All fields already known for {}", address));
            stats.email_processed();
            return Ok(());
        }

        if email.body_type == BodyType::Html {
            let content_ids = extract_content_ids(&email.body);
            if !content_ids.is_empty() {
                let images = self
                    .mailbox
                    .fetch_inline_images(&email.id, &content_ids)
                    .await?;
                debug!("Resolved {} inline images for {}", images.len(), email.id);
                email.attach_inline_images(images);
            }
        }

        self.events.log(format!(
            "Processing email from {}: {} fields to extract",
            address,
            needed.len()
        ));

        let images = Arc::new(email.image_bytes());
        let chunks = prompt::email_chunks(&email);
        let requests = needed.iter().map(|field| {
            self.extract_field(gate, ExtractionRequest {
                query: prompt::field_query(field, &address),
                model: config.model.clone(),
                context_chunks: chunks.clone(),
                images: Arc::clone(&images),
                field: (*field).clone(),
            })
        });
        let results = try_join_all(requests).await?;

        for (field, result) in needed.iter().zip(results) {
            let Some(extraction) = result else {
                debug!("No answer for {} of {}", field.field_name, address);
                continue;
            };

            let value = extraction.answer.value().map(str::to_string);
            stats.record_field(&field.field_name, extraction.cost, value.is_some());
            if let Some(value) = value {
                self.events
                    .log(format!("{} - {}: {}", address, field.field_name, value));
                contact.set(field.field_name.as_str(), value);
            }
        }

        stats.email_processed();
        Ok(())
    }

    async fn extract_field(
        &self,
        gate: &RequestGate,
        request: ExtractionRequest,
    ) -> Result<Option<Extraction>> {
        let _permit = gate.acquire().await?;
        self.extractor.extract(request).await
    }
}
