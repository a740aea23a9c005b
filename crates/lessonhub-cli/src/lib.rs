//! LessonHub line-oriented client
//!
//! Drives the chat runtime from stdin against the in-memory backend, printing
//! the view after every command. Useful for poking at switching, reconnects
//! and send failures by hand.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod commands;
pub mod render;
pub mod shell;

pub use commands::{Command, HELP, ParseError, parse};
pub use render::render;
pub use shell::{Flow, Shell};
