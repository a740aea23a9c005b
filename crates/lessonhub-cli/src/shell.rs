//! Command dispatch for the interactive client.
//!
//! Maps parsed [`Command`]s onto the runtime handle. The simulation commands
//! (`/incoming`, `/drop`) go straight to the in-memory backend.

use std::{io::Write, time::Duration};

use lessonhub_app::{RuntimeError, RuntimeHandle};
use lessonhub_core::{AuthContext, MessageDraft, Sender};
use lessonhub_harness::SimBackend;

use crate::{
    commands::{Command, HELP},
    render::render,
};

/// Whether the input loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read the next line.
    Continue,
    /// Exit.
    Quit,
}

/// Interactive client state.
pub struct Shell {
    handle: RuntimeHandle,
    backend: SimBackend,
    auth: AuthContext,
    settle: Duration,
}

impl Shell {
    /// Shell over a running runtime. `settle` is how long to wait for the
    /// runtime to react before printing the view.
    pub fn new(
        handle: RuntimeHandle,
        backend: SimBackend,
        auth: AuthContext,
        settle: Duration,
    ) -> Self {
        Self { handle, backend, auth, settle }
    }

    /// Execute one command and print the resulting view.
    pub async fn execute(
        &mut self,
        command: Command,
        out: &mut impl Write,
    ) -> Result<Flow, RuntimeError> {
        tracing::debug!(?command, "executing");
        match command {
            Command::Help => {
                writeln!(out, "{HELP}").ok();
                return Ok(Flow::Continue);
            },
            Command::Quit => {
                self.handle.shutdown().await;
                return Ok(Flow::Quit);
            },
            Command::Show => {},
            Command::Open(chat_id) => self.handle.select_chat(chat_id).await?,
            Command::Close => self.handle.clear_selection().await?,
            Command::Chats => self.handle.refresh_chat_list().await?,
            Command::Older => self.handle.load_older().await?,
            Command::Typing => self.handle.typing().await?,
            Command::Edit(message_id, content) => {
                self.handle.edit_message(message_id, content).await?;
            },
            Command::Delete(message_id) => self.handle.delete_message(message_id).await?,
            Command::Resend(local_id) => self.handle.retry_send(local_id).await?,
            Command::Discard(local_id) => self.handle.discard_failed(local_id).await?,
            Command::Retry => self.handle.retry().await?,
            Command::Dismiss => self.handle.dismiss_error().await?,
            Command::Login => {
                self.auth.token = Some(format!("token-{}", self.auth.user_id));
                self.handle.set_auth(self.auth.clone()).await?;
            },
            Command::Incoming(chat_id, text) => {
                let tutor = Sender { user_id: 100, display_name: "Ms. Rivera".into() };
                self.backend.inject_message(chat_id, tutor, &text);
            },
            Command::Drop(chat_id) => self.backend.force_close(chat_id),
            Command::Send(text) => self.handle.send_message(MessageDraft::text(text)).await?,
        }

        tokio::time::sleep(self.settle).await;
        self.show(out);
        Ok(Flow::Continue)
    }

    /// Stop the runtime. Safe to call after `/quit`.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }

    /// Print the current view.
    pub fn show(&self, out: &mut impl Write) {
        if let Err(err) = render(out, &self.handle.view()) {
            tracing::warn!(%err, "failed to render view");
        }
    }
}

#[cfg(test)]
mod tests {
    use lessonhub_app::{Runtime, RuntimeConfig, SystemEnv};
    use lessonhub_core::Role;

    use super::*;

    fn start(auth: AuthContext) -> (Shell, SimBackend) {
        let backend = SimBackend::demo(&auth);
        let (runtime, handle) = Runtime::new(
            backend.clone(),
            backend.clone(),
            SystemEnv::new(),
            auth.clone(),
            RuntimeConfig::default(),
        );
        tokio::spawn(runtime.run());
        let shell = Shell::new(handle, backend.clone(), auth, Duration::from_millis(500));
        (shell, backend)
    }

    fn ann(token: Option<&str>) -> AuthContext {
        AuthContext {
            user_id: 1,
            display_name: "Ann".into(),
            role: Role::Student,
            token: token.map(Into::into),
        }
    }

    async fn run(shell: &mut Shell, line: &str) -> String {
        let command = crate::commands::parse(line).unwrap().unwrap();
        let mut out = Vec::new();
        shell.execute(command, &mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn open_then_send_shows_confirmed_message() {
        let (mut shell, backend) = start(ann(Some("token-1")));

        let text = run(&mut shell, "/open 1").await;
        assert!(text.contains("Question 7 is the tricky one."));
        assert!(text.contains("[1] live"));

        let text = run(&mut shell, "see you thursday").await;
        assert!(text.contains("<you> see you thursday\n"));
        assert_eq!(backend.messages(1).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn simulated_incoming_message_is_shown() {
        let (mut shell, _backend) = start(ann(Some("token-1")));
        run(&mut shell, "/open 1").await;

        let text = run(&mut shell, "/incoming 1 check question 8").await;
        assert!(text.contains("<Ms. Rivera> check question 8"));
    }

    #[tokio::test(start_paused = true)]
    async fn login_recovers_signed_out_session() {
        let (mut shell, _backend) = start(ann(None));

        let text = run(&mut shell, "/open 1").await;
        assert!(text.contains("[1] error"));

        let text = run(&mut shell, "/login").await;
        assert!(text.contains("[1] live"));
    }

    #[tokio::test(start_paused = true)]
    async fn quit_stops_runtime() {
        let (mut shell, _backend) = start(ann(Some("token-1")));
        let mut out = Vec::new();
        assert_eq!(shell.execute(Command::Quit, &mut out).await, Ok(Flow::Quit));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(shell.handle.select_chat(1).await, Err(RuntimeError::Stopped));
    }
}
