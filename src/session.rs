use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::ExecutionClient,
    error::Error,
    format::{RenderedOutput, ResultFormatter},
    scheduler::ExecutionScheduler,
    types::{ContextId, ExecutionRequest, RequestStatus},
    Result,
};

/// Terminal notifications a session emits on the gateway event channel,
/// exactly one per session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Delivered {
        request_id: Uuid,
        context_id: ContextId,
        segments: Vec<String>,
        truncated: bool,
    },
    Failed {
        request_id: Uuid,
        context_id: ContextId,
        error: String,
    },
    Cancelled {
        request_id: Uuid,
        context_id: ContextId,
    },
}

/// Handle the chat layer keeps for an accepted submission.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub context_id: ContextId,
    cancel: CancellationToken,
    status: watch::Receiver<RequestStatus>,
}

impl SessionHandle {
    /// Request cancellation. Safe to call at any time, idempotent, and a
    /// no-op once the session is terminal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> RequestStatus {
        *self.status.borrow()
    }

    /// Wait until the session reaches a terminal status.
    pub async fn wait(&mut self) -> RequestStatus {
        loop {
            let current = *self.status.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if self.status.changed().await.is_err() {
                return *self.status.borrow();
            }
        }
    }
}

/// Per-submission orchestrator. Owns the status machine from intake to a
/// terminal outcome and coordinates scheduler, client and formatter.
pub struct RequestSession {
    request: ExecutionRequest,
    scheduler: Arc<ExecutionScheduler>,
    client: Arc<ExecutionClient>,
    formatter: Arc<ResultFormatter>,
    soft_deadline: Duration,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    status: watch::Sender<RequestStatus>,
}

impl RequestSession {
    pub(crate) fn new(
        request: ExecutionRequest,
        scheduler: Arc<ExecutionScheduler>,
        client: Arc<ExecutionClient>,
        formatter: Arc<ResultFormatter>,
        soft_deadline: Duration,
        events: mpsc::Sender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RequestStatus::Pending);
        let handle = SessionHandle {
            id: request.id,
            context_id: request.context_id,
            cancel: cancel.clone(),
            status: status_rx,
        };
        let session = Self {
            request,
            scheduler,
            client,
            formatter,
            soft_deadline,
            events,
            cancel,
            status: status_tx,
        };
        (session, handle)
    }

    /// Drive the session to a terminal state and emit its one event.
    pub async fn run(self) {
        let request_id = self.request.id;
        let context_id = self.request.context_id;

        let event = match self.drive().await {
            Ok(rendered) => {
                self.advance(RequestStatus::Delivered);
                info!("Request {} delivered", request_id);
                SessionEvent::Delivered {
                    request_id,
                    context_id,
                    segments: rendered.segments,
                    truncated: rendered.truncated,
                }
            }
            Err(Error::Cancelled) => {
                self.advance(RequestStatus::Cancelled);
                info!("Request {} cancelled", request_id);
                SessionEvent::Cancelled {
                    request_id,
                    context_id,
                }
            }
            Err(e) => {
                self.advance(RequestStatus::Failed);
                error!("Request {} failed: {}", request_id, e);
                SessionEvent::Failed {
                    request_id,
                    context_id,
                    error: e.to_string(),
                }
            }
        };

        if self.events.send(event).await.is_err() {
            warn!("Event channel closed, dropping outcome of {}", request_id);
        }
    }

    async fn drive(&self) -> Result<RenderedOutput> {
        let ticket = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            admitted = self.scheduler.admit(
                self.request.requester_id,
                self.request.context_id,
            ) => admitted?,
        };
        self.advance(RequestStatus::Dispatched);
        debug!(
            "Request {} dispatched for {} ({})",
            self.request.id, self.request.profile.display_name, self.request.profile.backend_id
        );

        self.advance(RequestStatus::AwaitingResult);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.client.cancel_job(self.request.id);
                drop(ticket);
                return Err(Error::Cancelled);
            }
            outcome = self.client.execute(&self.request, self.soft_deadline) => {
                // the remote call is over either way, free the slot before
                // formatting and delivery
                drop(ticket);
                outcome?
            }
        };

        self.advance(RequestStatus::Formatting);
        Ok(self.formatter.format(&result))
    }

    /// Advance the published status if the transition graph allows it.
    /// Illegal advances (e.g. after cancellation already made the session
    /// terminal) are silently dropped.
    fn advance(&self, next: RequestStatus) {
        self.status.send_if_modified(|current| {
            if current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}
