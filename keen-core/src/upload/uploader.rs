//! Upload cycles
//!
//! A cycle claims every uploadable event (marking it pending), sends the
//! events in size-bounded batches, then reconciles the store with what the
//! API reported. Only one cycle runs at a time per uploader.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use super::batch::{build_batches, parse_response, EventOutcome, PreparedBatches};
use crate::config::ProjectConfig;
use crate::db::{EventId, EventStore};
use crate::error::{Error, EventFailure, Result};
use crate::network::{HttpResponse, NetworkClient};

/// Phase of the current upload cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Collecting,
    InFlight,
    Reconciling,
}

/// Summary of one successful cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Events the API accepted
    pub events_sent: usize,
    /// Events dropped as permanently invalid or undecodable
    pub events_dropped: usize,
    /// Events kept for a later cycle
    pub events_retained: usize,
    /// Batch requests attempted
    pub requests: usize,
}

/// Running totals across cycles
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub cycles: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub api_calls: u64,
    pub api_failures: u64,
}

/// Drives upload cycles against one store
pub struct Uploader {
    store: Arc<EventStore>,
    network: Arc<NetworkClient>,
    max_request_bytes: usize,
    cycle: tokio::sync::Mutex<()>,
    state: Mutex<UploadState>,
    stats: Mutex<UploadStats>,
}

impl Uploader {
    pub fn new(
        store: Arc<EventStore>,
        network: Arc<NetworkClient>,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            store,
            network,
            max_request_bytes,
            cycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(UploadState::Idle),
            stats: Mutex::new(UploadStats::default()),
        }
    }

    pub fn state(&self) -> UploadState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run a cycle, waiting for any cycle already in flight
    pub async fn upload(&self, project: &ProjectConfig) -> Result<UploadReport> {
        let _cycle = self.cycle.lock().await;
        self.run_cycle(project).await
    }

    /// Run a cycle unless one is already in flight
    pub async fn try_upload(&self, project: &ProjectConfig) -> Result<UploadReport> {
        let _cycle = self
            .cycle
            .try_lock()
            .map_err(|_| Error::UploadInProgress)?;
        self.run_cycle(project).await
    }

    async fn run_cycle(&self, project: &ProjectConfig) -> Result<UploadReport> {
        let _idle = IdleOnDrop(&self.state);
        self.set_state(UploadState::Collecting);
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cycles += 1;

        if !self.network.is_connected() {
            warn!("Network unavailable; events stay queued");
            return Err(Error::NetworkDisconnected);
        }
        project.write_key()?;

        // No other cycle holds events, so anything still pending was
        // orphaned by an earlier failure or crash.
        let orphaned = self.store.reset_pending_events()?;
        if orphaned > 0 {
            warn!(orphaned, "Released events left pending by an earlier cycle");
        }

        let events = self.store.get_events();
        if events.is_empty() {
            debug!("No events to upload");
            return Ok(UploadReport::default());
        }

        let prepared = match build_batches(&events, self.max_request_bytes) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.store.reset_pending_events()?;
                return Err(e);
            }
        };
        debug!(
            events = events.len(),
            batches = prepared.batches.len(),
            "Prepared upload"
        );

        self.set_state(UploadState::InFlight);
        let mut responses = Vec::with_capacity(prepared.batches.len());
        for batch in &prepared.batches {
            let result = self
                .network
                .send_events(batch.body.clone(), project)
                .await;
            let stop = matches!(&result, Err(e) if e.is_network());
            responses.push(result);
            if stop {
                break;
            }
        }

        self.set_state(UploadState::Reconciling);
        self.reconcile(&prepared, responses)
    }

    fn reconcile(
        &self,
        prepared: &PreparedBatches,
        responses: Vec<Result<HttpResponse>>,
    ) -> Result<UploadReport> {
        let mut report = UploadReport {
            requests: responses.len(),
            ..UploadReport::default()
        };
        let mut delivered: Vec<EventId> = Vec::new();
        // Retained events the API answered for; only these use up an attempt
        let mut charged: Vec<EventId> = Vec::new();
        let mut failures: Vec<EventFailure> = Vec::new();
        let mut dominant: Option<Error> = None;
        let mut api_failures = 0u64;

        for id in &prepared.corrupt {
            delivered.push(*id);
            report.events_dropped += 1;
        }

        let mut responses = responses.into_iter();
        for batch in &prepared.batches {
            let (outcome, answered) = match responses.next() {
                Some(Ok(response)) if response.is_success() => {
                    (parse_response(&response.body, batch), true)
                }
                Some(Ok(response)) => (
                    Err(Error::HttpStatus {
                        status: response.status,
                        body: response.body_text(),
                    }),
                    true,
                ),
                Some(Err(e)) => (Err(e), false),
                // Not sent after an earlier transport failure
                None => {
                    report.events_retained += batch.event_count();
                    continue;
                }
            };

            let results = match outcome {
                Ok(results) => results,
                Err(e) => {
                    warn!(events = batch.event_count(), error = %e, "Batch upload failed");
                    api_failures += 1;
                    report.events_retained += batch.event_count();
                    if answered {
                        charged.extend(batch.event_ids());
                    }
                    keep_dominant(&mut dominant, e);
                    continue;
                }
            };

            for result in results {
                match result.outcome {
                    EventOutcome::Delivered => {
                        delivered.push(result.event_id);
                        report.events_sent += 1;
                    }
                    EventOutcome::Rejected { name, description } => {
                        warn!(
                            id = result.event_id,
                            collection = %result.collection,
                            error = %name,
                            %description,
                            "Dropping event rejected by the API"
                        );
                        delivered.push(result.event_id);
                        report.events_dropped += 1;
                        failures.push(EventFailure {
                            event_id: result.event_id,
                            collection: result.collection,
                            name,
                            description,
                            dropped: true,
                        });
                    }
                    EventOutcome::Retry { name, description } => {
                        debug!(id = result.event_id, error = %name, "Event will be retried");
                        report.events_retained += 1;
                        charged.push(result.event_id);
                        failures.push(EventFailure {
                            event_id: result.event_id,
                            collection: result.collection,
                            name,
                            description,
                            dropped: false,
                        });
                    }
                }
            }
        }

        if report.events_retained == 0 {
            self.store.purge_pending_events()?;
        } else {
            for id in &delivered {
                self.store.delete_event(*id)?;
            }
            self.store.charge_upload_attempts(&charged)?;
            self.store.reset_pending_events()?;
        }

        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.api_calls += report.requests as u64;
            stats.api_failures += api_failures;
            stats.events_sent += report.events_sent as u64;
            stats.events_dropped += report.events_dropped as u64;
        }

        if let Some(e) = dominant {
            error!(
                sent = report.events_sent,
                retained = report.events_retained,
                error = %e,
                "Upload incomplete"
            );
            return Err(e);
        }
        if !failures.is_empty() {
            warn!(
                sent = report.events_sent,
                failed = failures.len(),
                "Some events were not accepted"
            );
            return Err(Error::EventUpload { failures });
        }

        info!(
            sent = report.events_sent,
            dropped = report.events_dropped,
            requests = report.requests,
            "Upload complete"
        );
        Ok(report)
    }

    fn set_state(&self, state: UploadState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Ranks batch-level failures: transport > HTTP status > unreadable response
fn severity(error: &Error) -> u8 {
    match error {
        Error::HttpStatus { .. } => 2,
        Error::Response(_) => 1,
        _ => 3,
    }
}

fn keep_dominant(dominant: &mut Option<Error>, candidate: Error) {
    let replace = match dominant {
        Some(current) => severity(&candidate) > severity(current),
        None => true,
    };
    if replace {
        *dominant = Some(candidate);
    }
}

struct IdleOnDrop<'a>(&'a Mutex<UploadState>);

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = UploadState::Idle;
    }
}
