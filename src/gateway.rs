use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    client::ExecutionClient,
    config::GatewayConfig,
    format::ResultFormatter,
    registry::LanguageRegistry,
    scheduler::ExecutionScheduler,
    session::{RequestSession, SessionEvent, SessionHandle},
    types::{ContextId, ExecutionOptions, ExecutionRequest, LanguageProfile, RequesterId},
    Result,
};

/// Buffered terminal events before the consumer has to catch up.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A parsed code submission handed over by the chat layer.
#[derive(Debug, Clone)]
pub struct Intake {
    pub requester_id: RequesterId,
    pub context_id: ContextId,
    pub language_tag: String,
    pub source: String,
    pub stdin: Option<String>,
    pub options: ExecutionOptions,
}

/// The code-execution gateway: owns the language registry, the scheduler and
/// the upstream client, and spawns one session task per submission. Terminal
/// outcomes arrive on the event receiver returned by the constructor.
pub struct Gateway {
    registry: Arc<LanguageRegistry>,
    scheduler: Arc<ExecutionScheduler>,
    client: Arc<ExecutionClient>,
    formatter: Arc<ResultFormatter>,
    config: GatewayConfig,
    events: mpsc::Sender<SessionEvent>,
    sessions: Arc<Mutex<HashMap<Uuid, SessionHandle>>>,
}

impl Gateway {
    /// Build a gateway around a pre-loaded profile list.
    pub fn with_profiles(
        config: GatewayConfig,
        profiles: Vec<LanguageProfile>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let registry = Arc::new(LanguageRegistry::from_profiles(profiles)?);
        let client = Arc::new(ExecutionClient::new(&config)?);
        Self::assemble(config, registry, client)
    }

    /// Build a gateway whose registry is fetched from the execution service's
    /// backend list.
    pub async fn from_upstream(
        config: GatewayConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let client = Arc::new(ExecutionClient::new(&config)?);
        let profiles = client.fetch_profiles().await?;
        let registry = Arc::new(LanguageRegistry::from_profiles(profiles)?);
        Self::assemble(config, registry, client)
    }

    fn assemble(
        config: GatewayConfig,
        registry: Arc<LanguageRegistry>,
        client: Arc<ExecutionClient>,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        let scheduler = Arc::new(ExecutionScheduler::new(
            config.max_concurrent,
            config.admission_timeout,
            config.quota.clone(),
        ));
        let formatter = Arc::new(ResultFormatter::new(config.format.clone()));
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        info!(
            "Gateway ready: {} languages, {} execution slots",
            registry.len(),
            config.max_concurrent
        );
        Ok((
            Self {
                registry,
                scheduler,
                client,
                formatter,
                config,
                events,
                sessions: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        ))
    }

    /// Accept a submission. The language resolves synchronously, so a bad tag
    /// is an immediate error; everything later in the request's life is
    /// reported through the event channel.
    pub fn submit(&self, intake: Intake) -> Result<SessionHandle> {
        let profile = self.registry.resolve(&intake.language_tag)?;
        let request = ExecutionRequest::new(
            intake.requester_id,
            intake.context_id,
            profile,
            intake.source,
            intake.stdin,
            intake.options,
        );
        debug!(
            "Accepted submission {} from requester {} in context {}",
            request.id, request.requester_id, request.context_id
        );

        let (session, handle) = RequestSession::new(
            request,
            self.scheduler.clone(),
            self.client.clone(),
            self.formatter.clone(),
            self.config.soft_deadline,
            self.events.clone(),
        );

        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(handle.id, handle.clone());

        let sessions = self.sessions.clone();
        let session_id = handle.id;
        tokio::spawn(async move {
            session.run().await;
            sessions
                .lock()
                .expect("session table lock poisoned")
                .remove(&session_id);
        });

        Ok(handle)
    }

    /// Cancel a live session by id, e.g. when the originating chat message is
    /// edited or deleted. Idempotent; unknown or finished ids are a no-op.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        let sessions = self.sessions.lock().expect("session table lock poisoned");
        match sessions.get(&session_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Sessions that have not reached a terminal state yet.
    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .len()
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Refresh the language registry from the execution service.
    pub async fn reload_languages(&self) -> Result<()> {
        let profiles = self.client.fetch_profiles().await?;
        self.registry.reload(profiles)
    }
}
