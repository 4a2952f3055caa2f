//! Client-side result poller.
//!
//! While a viewed request is `Completed` without a result, the poller
//! re-fetches it at a fixed interval until the result appears, then stops.
//!
//! - The fetch runs inside the polling task. A tick that fires while a fetch
//!   is still pending drops it and issues the next one, so observers never
//!   see responses out of order.
//! - `watch` on another request cancels the current session first.
//! - `cancel` is an explicit operation; dropping the poller also cancels.
//!
//! Fetch errors are logged and polling continues: "no result yet" is never
//! an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::actor::Actor;
use crate::domain::beam::Catalog;
use crate::domain::request::RequestId;
use crate::error::Result;
use crate::manager::Storage;
use crate::service::{RequestService, RequestView};

/// Where the poller reads requests from.
#[async_trait]
pub trait RequestSource: Send + Sync + 'static {
    async fn fetch(&self, id: RequestId) -> Result<RequestView>;
}

/// Reads through a [`RequestService`] in the same process, as a given actor.
pub struct ServiceSource<S, C> {
    service: RequestService<S, C>,
    actor: Actor,
}

impl<S, C> ServiceSource<S, C> {
    pub fn new(service: RequestService<S, C>, actor: Actor) -> Self {
        Self { service, actor }
    }
}

#[async_trait]
impl<S, C> RequestSource for ServiceSource<S, C>
where
    S: Storage + 'static,
    C: Catalog + 'static,
{
    async fn fetch(&self, id: RequestId) -> Result<RequestView> {
        self.service.view(&self.actor, id).await
    }
}

/// Reads from a running server over HTTP.
pub struct HttpRequestSource {
    client: reqwest::Client,
    base_url: String,
    actor: Actor,
}

impl HttpRequestSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, actor: Actor) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            actor,
        }
    }
}

#[async_trait]
impl RequestSource for HttpRequestSource {
    async fn fetch(&self, id: RequestId) -> Result<RequestView> {
        let url = format!("{}/api/requests/{}", self.base_url, id);
        let view = self
            .client
            .get(&url)
            .header(crate::api::ACTOR_HEADER, self.actor.id.to_string())
            .header(crate::api::MODERATOR_HEADER, self.actor.moderator.to_string())
            .send()
            .await?
            .error_for_status()?
            .json::<RequestView>()
            .await?;
        Ok(view)
    }
}

/// What the poller currently knows.
#[derive(Debug, Clone, PartialEq)]
pub enum PollState {
    /// No request is being watched.
    Idle,
    /// Waiting for the result of `request_id`.
    Waiting {
        request_id: RequestId,
        attempts: u32,
        last_error: Option<String>,
    },
    /// The result arrived; polling stopped.
    Converged(Box<RequestView>),
    /// The request is not waiting for a result; nothing to poll.
    NotAwaiting(Box<RequestView>),
    /// The session was cancelled before convergence.
    Cancelled { request_id: RequestId },
}

impl PollState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PollState::Converged(_) | PollState::NotAwaiting(_) | PollState::Cancelled { .. }
        )
    }
}

struct Session {
    request_id: RequestId,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Polls one request at a time until its result converges.
pub struct Poller<R> {
    source: Arc<R>,
    interval: Duration,
    state_tx: watch::Sender<PollState>,
    session: parking_lot::Mutex<Option<Session>>,
}

impl<R: RequestSource> Poller<R> {
    pub fn new(source: Arc<R>, interval: Duration) -> Self {
        let (state_tx, _) = watch::channel(PollState::Idle);
        Self {
            source,
            interval,
            state_tx,
            session: parking_lot::Mutex::new(None),
        }
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> PollState {
        self.state_tx.borrow().clone()
    }

    /// The request currently being polled, if any. A session that converged
    /// or found the request no longer awaiting a result is not reported.
    pub fn watching(&self) -> Option<RequestId> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| !s.token.is_cancelled())
            .map(|s| s.request_id)
    }

    /// Start polling `view`, superseding any current session. Does nothing
    /// beyond recording the state if the request is not awaiting a result.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self, view: RequestView) {
        self.cancel();

        if !view.awaiting_result() {
            self.state_tx
                .send_replace(PollState::NotAwaiting(Box::new(view)));
            return;
        }

        let request_id = view.id;
        let token = CancellationToken::new();
        self.state_tx.send_replace(PollState::Waiting {
            request_id,
            attempts: 0,
            last_error: None,
        });

        let task = tokio::spawn(poll_loop(
            self.source.clone(),
            request_id,
            self.interval,
            token.clone(),
            self.state_tx.clone(),
        ));
        tracing::debug!(request_id = %request_id, interval_ms = self.interval.as_millis() as u64, "Polling started");

        *self.session.lock() = Some(Session {
            request_id,
            token,
            task,
        });
    }

    /// Stop the current session, if any. Aborting the polling task drops its
    /// pending fetch and its timer.
    pub fn cancel(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        session.token.cancel();
        session.task.abort();

        // A finished session keeps its final state
        self.state_tx.send_if_modified(|state| {
            if state.is_finished() {
                return false;
            }
            *state = PollState::Cancelled {
                request_id: session.request_id,
            };
            true
        });
        tracing::debug!(request_id = %session.request_id, "Polling cancelled");
    }
}

impl<R> Drop for Poller<R> {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.token.cancel();
            session.task.abort();
        }
    }
}

async fn poll_loop<R: RequestSource>(
    source: Arc<R>,
    request_id: RequestId,
    period: Duration,
    token: CancellationToken,
    state_tx: watch::Sender<PollState>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The view that started the session is fresh; first fetch after one period
    ticker.tick().await;

    let mut attempts = 0u32;
    let mut due = false;

    loop {
        if !due {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }
        due = false;
        attempts += 1;

        // The next tick drops a fetch that is still pending
        let fetched = tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                tracing::debug!(request_id = %request_id, attempts, "Fetch superseded by next tick");
                due = true;
                continue;
            }
            fetched = source.fetch(request_id) => fetched,
        };

        let (next, finished) = match fetched {
            Ok(view) if view.result.is_some() => {
                tracing::info!(request_id = %request_id, attempts, "Result converged");
                (PollState::Converged(Box::new(view)), true)
            }
            Ok(view) if !view.awaiting_result() => {
                tracing::info!(request_id = %request_id, status = %view.status, "Request no longer awaiting a result");
                (PollState::NotAwaiting(Box::new(view)), true)
            }
            Ok(_) => (
                PollState::Waiting {
                    request_id,
                    attempts,
                    last_error: None,
                },
                false,
            ),
            Err(e) => {
                tracing::warn!(request_id = %request_id, error = %e, "Poll failed, will retry");
                (
                    PollState::Waiting {
                        request_id,
                        attempts,
                        last_error: Some(e.to_string()),
                    },
                    false,
                )
            }
        };

        // Checked under the channel lock so a concurrent cancel always wins
        state_tx.send_if_modified(|state| {
            if token.is_cancelled() {
                return false;
            }
            *state = next;
            true
        });

        if finished {
            token.cancel();
            break;
        }
    }
}
