//! # Code-execution gateway
//!
//! A chat-facing gateway that runs user-submitted code snippets on a remote
//! multi-language execution service. It resolves user-facing language tags to
//! concrete compiler backends, bounds concurrency and per-user usage, retries
//! transient upstream failures, and renders heterogeneous compiler/runtime
//! output into size-limited chat messages.
//!
//! The chat transport stays outside this crate: it hands submissions to
//! [`Gateway::submit`], cancels them through [`Gateway::cancel`] or a
//! [`SessionHandle`], and receives one terminal [`SessionEvent`] per
//! submission on the channel returned by the gateway constructor.

mod client;
mod config;
mod error;
mod format;
mod gateway;
mod registry;
mod scheduler;
mod session;
mod types;

pub use client::ExecutionClient;
pub use config::{FormatConfig, GatewayConfig, QuotaConfig};
pub use error::Error;
pub use format::{RenderedOutput, ResultFormatter};
pub use gateway::{Gateway, Intake};
pub use registry::LanguageRegistry;
pub use scheduler::{ExecutionScheduler, Ticket};
pub use session::{RequestSession, SessionEvent, SessionHandle};
pub use types::{
    ContextId, ExecutionOptions, ExecutionRequest, ExecutionResult, LanguageProfile,
    RequestStatus, RequesterId,
};

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, Error>;
