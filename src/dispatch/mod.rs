//! Computation dispatcher.
//!
//! When a request is completed, the dispatcher arranges for exactly one
//! authoritative computation to eventually populate its result, without
//! blocking the completion itself. Two backends sit behind one interface and
//! one is chosen once, at construction, from the injected [`Config`]:
//!
//! - **External**: POST a [`TriggerPayload`] to the configured service, which
//!   later delivers the result through the callback. Delivery failures are
//!   logged and swallowed; the request stays `Completed` without a result.
//! - **Simulated**: wait for the configured delay, re-read the request and,
//!   if it is still `Completed` with no result on the same generation, run
//!   the deflection engine and write the result.
//!
//! Jobs are handed over through a bounded queue consumed by a dedicated
//! worker task, so the caller's transaction has committed before any
//! computation starts and the worker's lifecycle (startup, draining on
//! shutdown) is explicit.
//!
//! The worker takes a job off the queue only once it holds one of the
//! `max_in_flight` permits, and the job keeps that permit until it ends,
//! simulated delay included. When every permit is taken, jobs back up in
//! the queue and `dispatch` refuses new ones once it is full.
//!
//! ```text
//! complete() ──commit──> Dispatcher::dispatch ──try_send──> [queue] ──> worker
//!                                                                       │
//!                                                  ┌────────────────────┴───────────┐
//!                                                  ▼                                ▼
//!                                       External: POST trigger         Simulated: sleep, guard, write
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::domain::beam::{BeamId, Catalog};
use crate::domain::request::{CalculationResult, RequestId, RequestStatus, ResultWrite};
use crate::engine;
use crate::error::{BeamcheckError, Result};
use crate::http::{HttpClient, OutboundRequest};
use crate::manager::Storage;

pub mod payload;

pub use payload::{BeamFields, CallbackDescriptor, TriggerItem, TriggerPayload};

/// A unit of work: compute the result of one completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchJob {
    pub request_id: RequestId,
    /// Generation stamped by the `complete` transition
    pub generation: u64,
}

/// Which backend a dispatcher runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    External,
    Simulated,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::External => "external",
            DispatchMode::Simulated => "simulated",
        }
    }
}

/// What a finished job did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The external service accepted the trigger.
    Delivered { status: u16 },
    /// The simulation wrote the result.
    Written { deflection_mm: f64 },
    /// The request no longer needed a computation.
    Skipped(&'static str),
}

/// Counters describing the dispatcher's work so far.
#[derive(Debug, Default)]
struct DispatchStats {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    delivered: AtomicU64,
    written: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub queued: usize,
    pub in_flight: usize,
    pub delivered: u64,
    pub written: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl DispatchStatsSnapshot {
    /// Jobs that have run to an outcome, failures included.
    pub fn finished(&self) -> u64 {
        self.delivered + self.written + self.skipped + self.failed
    }
}

impl DispatchStats {
    fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Settings for the external backend.
#[derive(Debug, Clone)]
struct ExternalBackend<H> {
    http_client: Arc<H>,
    service_url: String,
    callback_url_template: Option<String>,
    callback_token: Option<String>,
    trigger_token: Option<String>,
    timeout_ms: u64,
}

/// Settings for the simulated backend.
#[derive(Debug, Clone)]
struct SimulatedBackend {
    delay: Duration,
}

enum Backend<H> {
    External(ExternalBackend<H>),
    Simulated(SimulatedBackend),
}

impl<H> Backend<H> {
    fn mode(&self) -> DispatchMode {
        match self {
            Backend::External(_) => DispatchMode::External,
            Backend::Simulated(_) => DispatchMode::Simulated,
        }
    }
}

/// Handle to the running dispatcher.
///
/// `dispatch` never blocks: it enqueues the job or fails immediately.
pub struct Dispatcher {
    mode: DispatchMode,
    tx: mpsc::Sender<DispatchJob>,
    shutdown_token: CancellationToken,
    worker: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stats: Arc<DispatchStats>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("mode", &self.mode)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl Dispatcher {
    /// Start the worker task and return its handle.
    ///
    /// The external backend is selected iff `config.service_url` is set.
    /// Must be called from within a Tokio runtime.
    pub fn spawn<S, C, H>(
        config: &Config,
        storage: Arc<S>,
        catalog: Arc<C>,
        http_client: Arc<H>,
    ) -> Self
    where
        S: Storage + 'static,
        C: Catalog + 'static,
        H: HttpClient + 'static,
    {
        let config = config.clone().normalized();
        let backend = match config.service_url.clone() {
            Some(service_url) => Backend::External(ExternalBackend {
                http_client,
                service_url,
                callback_url_template: config.callback_url_template.clone(),
                callback_token: config.callback_token.clone(),
                trigger_token: config.trigger_token.clone(),
                timeout_ms: config.request_timeout_ms,
            }),
            None => Backend::Simulated(SimulatedBackend {
                delay: config.sim_delay(),
            }),
        };
        let mode = backend.mode();

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown_token = CancellationToken::new();
        let stats = Arc::new(DispatchStats::default());

        let worker = Arc::new(Worker {
            backend,
            storage,
            catalog,
            stats: stats.clone(),
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            shutdown_grace: config.shutdown_grace(),
        });
        let handle = tokio::spawn(worker.run(rx, shutdown_token.clone()));

        tracing::info!(
            mode = mode.as_str(),
            queue_capacity = config.queue_capacity,
            max_in_flight = config.max_in_flight,
            "Dispatcher started"
        );

        Dispatcher {
            mode,
            tx,
            shutdown_token,
            worker: parking_lot::Mutex::new(Some(handle)),
            stats,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Hand a job to the worker. Fire-and-forget: never waits for the
    /// computation and never blocks on a full queue.
    #[tracing::instrument(skip(self), fields(request_id = %job.request_id, generation = job.generation))]
    pub fn dispatch(&self, job: DispatchJob) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(BeamcheckError::Shutdown);
        }

        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(job) {
            Ok(()) => {
                tracing::debug!(mode = self.mode.as_str(), "Dispatch job queued");
                Ok(())
            }
            Err(e) => {
                self.stats.queued.fetch_sub(1, Ordering::Relaxed);
                counter!(
                    "beamcheck_dispatch_total",
                    "backend" => self.mode.as_str(),
                    "outcome" => "rejected"
                )
                .increment(1);
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(BeamcheckError::Other(
                        anyhow::anyhow!("Dispatch queue is full"),
                    )),
                    mpsc::error::TrySendError::Closed(_) => Err(BeamcheckError::Shutdown),
                }
            }
        }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Stop accepting jobs, run what is already queued, and wait up to the
    /// configured grace period for in-flight jobs before aborting them.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "Dispatcher worker terminated abnormally");
        }
    }
}

/// A job's claim on the worker: one permit and one `in_flight` count,
/// both released when the job's task ends, aborted or not.
struct Slot {
    stats: Arc<DispatchStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

fn log_joined(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && !e.is_cancelled()
    {
        tracing::error!(error = %e, "Dispatch job panicked");
    }
}

struct Worker<S, C, H> {
    backend: Backend<H>,
    storage: Arc<S>,
    catalog: Arc<C>,
    stats: Arc<DispatchStats>,
    permits: Arc<Semaphore>,
    shutdown_grace: Duration,
}

impl<S, C, H> Worker<S, C, H>
where
    S: Storage + 'static,
    C: Catalog + 'static,
    H: HttpClient + 'static,
{
    async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<DispatchJob>,
        shutdown_token: CancellationToken,
    ) {
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_joined(joined);
            }

            let permit = tokio::select! {
                _ = shutdown_token.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_joined(joined);
                    continue;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => self.clone().start(job, permit, &mut in_flight),
                    None => break,
                },
            }
        }

        // Drain: stop intake, run whatever was already queued within the grace period
        rx.close();
        tracing::info!(
            queued = rx.len(),
            in_flight = in_flight.len(),
            "Dispatcher shutting down"
        );

        let mut drained = 0usize;
        let drain = async {
            loop {
                tokio::select! {
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => log_joined(joined),
                    permit = self.permits.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let Some(job) = rx.recv().await else { break };
                        self.clone().start(job, permit, &mut in_flight);
                        drained += 1;
                    }
                }
            }
            while let Some(joined) = in_flight.join_next().await {
                log_joined(joined);
            }
        };

        if tokio::time::timeout(self.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                remaining = in_flight.len(),
                "Shutdown grace period elapsed, aborting in-flight dispatch jobs"
            );
            in_flight.shutdown().await;

            while let Ok(job) = rx.try_recv() {
                self.stats.queued.fetch_sub(1, Ordering::Relaxed);
                tracing::warn!(
                    request_id = %job.request_id,
                    generation = job.generation,
                    "Dispatch job abandoned at shutdown, request remains completed without a result"
                );
            }
        }
        tracing::info!(drained, "Dispatcher stopped");
    }

    fn start(
        self: Arc<Self>,
        job: DispatchJob,
        permit: OwnedSemaphorePermit,
        in_flight: &mut JoinSet<()>,
    ) {
        // Counted as in flight before the queued count drops, so a job is never invisible
        self.stats.in_flight.fetch_add(1, Ordering::Relaxed);
        self.stats.queued.fetch_sub(1, Ordering::Relaxed);
        let slot = Slot {
            stats: self.stats.clone(),
            _permit: permit,
        };
        in_flight.spawn(async move {
            let outcome = self.execute(job).await;
            drop(slot);
            self.record(job, outcome);
        });
    }

    async fn execute(&self, job: DispatchJob) -> Result<JobOutcome> {
        match &self.backend {
            Backend::External(external) => self.trigger_external(external, job).await,
            Backend::Simulated(simulated) => self.simulate(simulated, job).await,
        }
    }

    fn record(&self, job: DispatchJob, outcome: Result<JobOutcome>) {
        let backend = self.backend.mode().as_str();
        let label = match &outcome {
            Ok(JobOutcome::Delivered { status }) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::info!(request_id = %job.request_id, status, "Trigger delivered");
                "delivered"
            }
            Ok(JobOutcome::Written { deflection_mm }) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    request_id = %job.request_id,
                    deflection_mm,
                    "Simulated result written"
                );
                "written"
            }
            Ok(JobOutcome::Skipped(reason)) => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(request_id = %job.request_id, reason, "Dispatch job skipped");
                "skipped"
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                // Operator-visible: the request stays Completed without a result
                tracing::error!(
                    request_id = %job.request_id,
                    generation = job.generation,
                    backend,
                    error = %e,
                    "Dispatch failed, request remains completed without a result"
                );
                "failed"
            }
        };
        counter!("beamcheck_dispatch_total", "backend" => backend, "outcome" => label)
            .increment(1);
    }

    async fn trigger_external(
        &self,
        external: &ExternalBackend<H>,
        job: DispatchJob,
    ) -> Result<JobOutcome> {
        let request = self.storage.get_request(job.request_id).await?;
        if request.status != RequestStatus::Completed {
            return Ok(JobOutcome::Skipped("not completed"));
        }
        if request.generation != job.generation {
            return Ok(JobOutcome::Skipped("superseded generation"));
        }

        let beam_ids: Vec<BeamId> = request.items.iter().map(|i| i.beam_id).collect();
        let specs = self.catalog.resolve(&beam_ids).await?;
        let callback = external.callback_url_template.as_deref().map(|template| {
            CallbackDescriptor::from_template(
                template,
                request.id,
                external.callback_token.as_deref(),
            )
        });
        let payload = TriggerPayload::build(&request, &specs, callback);

        let outbound = OutboundRequest {
            url: external.service_url.clone(),
            body: serde_json::to_string(&payload)?,
            token: external.trigger_token.clone(),
            timeout_ms: external.timeout_ms,
        };
        let response = external.http_client.post_json(&outbound).await?;
        if !response.is_success() {
            return Err(BeamcheckError::Other(anyhow::anyhow!(
                "External service returned status {}: {}",
                response.status,
                response.body
            )));
        }
        Ok(JobOutcome::Delivered {
            status: response.status,
        })
    }

    async fn simulate(&self, simulated: &SimulatedBackend, job: DispatchJob) -> Result<JobOutcome> {
        // The timer is only "cancelled" by the guard check when it fires
        tokio::time::sleep(simulated.delay).await;

        let request = self.storage.get_request(job.request_id).await?;
        if !request.awaiting_result() {
            return Ok(JobOutcome::Skipped("no longer awaiting a result"));
        }
        if request.generation != job.generation {
            return Ok(JobOutcome::Skipped("superseded generation"));
        }

        // Items are frozen once formed, so computing outside the write scope is safe
        let beam_ids: Vec<BeamId> = request.items.iter().map(|i| i.beam_id).collect();
        let specs = self.catalog.resolve(&beam_ids).await?;
        let Some(aggregate) = engine::aggregate(&request.items, &specs) else {
            tracing::warn!(
                request_id = %job.request_id,
                "No item has a defined deflection, leaving result empty"
            );
            return Ok(JobOutcome::Skipped("aggregate undefined"));
        };

        let result = CalculationResult {
            deflection_mm: aggregate.total_deflection_mm,
            within_norm: aggregate.within_norm,
            calculated_at: Utc::now(),
        };
        let (_, write) = self
            .storage
            .update_request(job.request_id, |r| {
                Ok(r.apply_simulated_result(job.generation, result))
            })
            .await?;

        Ok(match write {
            ResultWrite::Written => JobOutcome::Written {
                deflection_mm: aggregate.total_deflection_mm,
            },
            ResultWrite::Skipped(reason) => {
                tracing::debug!(request_id = %job.request_id, ?reason, "Simulated write lost the race");
                JobOutcome::Skipped("guard failed at write time")
            }
        })
    }
}
