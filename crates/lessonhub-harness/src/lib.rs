//! Deterministic simulation harness for the LessonHub chat layer.
//!
//! - [`SimEnv`]: virtual clock and seeded RNG behind the `Environment` trait
//! - [`SimBackend`]: in-memory server implementing both collaborator traits,
//!   with fault injection
//! - [`SessionHarness`]: drives a session step by step under virtual time
//!
//! # Invariant Testing
//!
//! The `invariants` module extracts observable session state into a
//! [`SessionSnapshot`] and checks behavioral properties against it. The
//! scenario driver checks [`InvariantRegistry::standard()`] after every step.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod invariants;
pub mod scenario;
pub mod sim_backend;
pub mod sim_env;

pub use invariants::{
    CacheScopedToSelection, Invariant, InvariantRegistry, InvariantResult, OrderedMessages,
    PhaseMatchesSelection, SelectionHighlighted, SessionSnapshot, TypingExcludesSelf,
    UniqueMessageIds, Violation,
};
pub use scenario::{SessionHarness, message, signed_in, typing_user};
pub use sim_backend::{SimBackend, participant};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv, SimInstant};
