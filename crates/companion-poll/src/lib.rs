//! Authenticated polling for the companion auction API
//!
//! `PollingOrchestrator` drives one request/response cycle at a time:
//! acquire a bundle from the shared `CredentialPool`, render the stream's
//! `RequestTemplate` with that bundle's ticket, auth material, and a fresh
//! sequence number, execute it through the injected `Transport`, classify
//! the response, report back to the pool, and forward successes to the
//! `ResultSink`.
//!
//! `poll_loop` repeats that at a fixed cadence with jittered exponential
//! backoff on transient failures and a consecutive-failure circuit breaker.

pub mod backoff;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod template;

pub use backoff::Backoff;
pub use error::{PollError, TemplateError};
pub use orchestrator::{
    CYCLE_KEYS, CycleState, LoopExit, LoopSummary, OrchestratorSettings, PollRequestContext,
    PollingOrchestrator,
};
pub use outcome::{PollOutcome, classify};
pub use template::{RequestTemplate, TemplateContext};
