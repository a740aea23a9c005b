//! LessonHub demo client.
//!
//! # Usage
//!
//! ```bash
//! # Sign in as student 1 and chat with the demo tutors
//! lessonhub --user-id 1 --name Ann
//!
//! # Start signed out, then /login to recover
//! lessonhub --signed-out --log-level debug
//! ```

use std::{
    io::{self, Write},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use lessonhub_app::{Runtime, RuntimeConfig, SystemEnv};
use lessonhub_cli::{Flow, Shell, parse};
use lessonhub_core::{AuthContext, Role};
use lessonhub_harness::SimBackend;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LessonHub chat client
#[derive(Parser, Debug)]
#[command(name = "lessonhub")]
#[command(about = "Line-oriented client for LessonHub forum chats")]
#[command(version)]
struct Args {
    /// User ID to sign in as
    #[arg(long, default_value = "1")]
    user_id: u64,

    /// Display name
    #[arg(long, default_value = "Ann")]
    name: String,

    /// Forum role
    #[arg(long, value_enum, default_value = "student")]
    role: RoleArg,

    /// Start without an access token
    #[arg(long)]
    signed_out: bool,

    /// Session tick interval in milliseconds
    #[arg(long, default_value = "50")]
    tick_ms: u64,

    /// How long to wait before printing the view after a command
    #[arg(long, default_value = "400")]
    settle_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Student,
    Teacher,
    Tutor,
    Parent,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Student => Self::Student,
            RoleArg::Teacher => Self::Teacher,
            RoleArg::Tutor => Self::Tutor,
            RoleArg::Parent => Self::Parent,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    let auth = AuthContext {
        user_id: args.user_id,
        display_name: args.name,
        role: args.role.into(),
        token: (!args.signed_out).then(|| format!("token-{}", args.user_id)),
    };
    tracing::info!(user_id = auth.user_id, role = %auth.role, "LessonHub client starting");

    let backend = SimBackend::demo(&auth);
    let config =
        RuntimeConfig { tick_interval: Duration::from_millis(args.tick_ms), ..Default::default() };
    let (runtime, handle) =
        Runtime::new(backend.clone(), backend.clone(), SystemEnv::new(), auth.clone(), config);
    let task = tokio::spawn(runtime.run());

    let mut shell = Shell::new(handle, backend, auth, Duration::from_millis(args.settle_ms));
    tokio::time::sleep(Duration::from_millis(args.settle_ms)).await;
    shell.show(&mut io::stdout().lock());
    writeln!(io::stdout().lock(), "type /help for commands")?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                writeln!(io::stdout().lock(), "{err}")?;
                continue;
            },
        };

        let mut out = Vec::new();
        let flow = shell.execute(command, &mut out).await;
        let mut stdout = io::stdout().lock();
        stdout.write_all(&out)?;
        match flow {
            Ok(Flow::Continue) => {},
            Ok(Flow::Quit) => break,
            Err(err) if err.is_rejection() => writeln!(stdout, "rejected: {err}")?,
            Err(err) => {
                tracing::error!(%err, "runtime gone");
                break;
            },
        }
    }

    shell.shutdown().await;
    task.await?;
    tracing::info!("LessonHub client stopped");
    Ok(())
}
