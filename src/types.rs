use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Chat-platform id of the user who submitted the code.
pub type RequesterId = u64;

/// Chat-platform id of the channel/thread the submission came from.
pub type ContextId = u64;

/// A user-facing language alias resolved to a concrete backend of the
/// execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// User-facing alias, stored lowercase
    pub alias: String,
    /// Backend compiler/interpreter id understood by the execution service
    pub backend_id: String,
    /// Exact compiler/interpreter version
    pub compiler_version: String,
    /// Human-readable language name for rendering
    pub display_name: String,
}

/// Recognized execution options and how they affect the remote invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Extra flags passed to the compiler invocation
    #[serde(default)]
    pub compiler_flags: Vec<String>,
    /// Extra flags passed to the program at run time
    #[serde(default)]
    pub runtime_flags: Vec<String>,
    /// Ask the backend to compile with optimizations
    #[serde(default)]
    pub optimize: bool,
}

/// A single code submission. Immutable after creation; the session owns the
/// mutable status.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub requester_id: RequesterId,
    pub context_id: ContextId,
    pub profile: Arc<LanguageProfile>,
    pub source: String,
    pub stdin: Option<String>,
    pub options: ExecutionOptions,
    pub submitted_at: Instant,
}

impl ExecutionRequest {
    pub fn new(
        requester_id: RequesterId,
        context_id: ContextId,
        profile: Arc<LanguageProfile>,
        source: String,
        stdin: Option<String>,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            requester_id,
            context_id,
            profile,
            source,
            stdin,
            options,
            submitted_at: Instant::now(),
        }
    }
}

/// Normalized outcome of a remote execution. Compile and runtime failures of
/// the submitted code are successful results here, carried in `exit_code`,
/// `signal` and `compile_output`.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub exit_code: i32,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub compile_output: String,
    pub duration: Duration,
}

/// Session status. Transitions are monotonic and never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Dispatched,
    AwaitingResult,
    Formatting,
    Delivered,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Delivered | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    /// Whether moving to `next` respects the transition graph:
    /// Pending -> Dispatched -> AwaitingResult -> Formatting -> Delivered,
    /// with Failed reachable while dispatching or awaiting the result and
    /// Cancelled reachable from any non-terminal state.
    pub fn can_advance_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Pending => false,
            Dispatched => *self == Pending,
            AwaitingResult => *self == Dispatched,
            Formatting => *self == AwaitingResult,
            Delivered => *self == Formatting,
            Failed => matches!(self, Pending | Dispatched | AwaitingResult),
            Cancelled => true,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Dispatched => "dispatched",
            RequestStatus::AwaitingResult => "awaiting_result",
            RequestStatus::Formatting => "formatting",
            RequestStatus::Delivered => "delivered",
            RequestStatus::Failed => "failed",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}
