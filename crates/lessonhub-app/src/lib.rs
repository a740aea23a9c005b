//! LessonHub chat runtime
//!
//! Production glue around [`lessonhub_chat`]'s Sans-IO session: a tokio event
//! loop that executes session actions against the REST and push
//! collaborators and publishes view snapshots.
//!
//! # Components
//!
//! - [`ChatApi`], [`PushTransport`]: collaborator traits
//! - [`Runtime`]: event loop owning the session and its spawned tasks
//! - [`RuntimeHandle`]: cloneable command and view handle
//! - [`SystemEnv`]: production environment (tokio clock, OS randomness)

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod backend;
mod error;
mod runtime;
mod system_env;

pub use backend::{ChannelEndpoint, ChannelHandle, ChatApi, PushTransport};
pub use error::RuntimeError;
pub use runtime::{AppCommand, Runtime, RuntimeConfig, RuntimeHandle};
pub use system_env::SystemEnv;
