//! Itero command line client.
//!
//! Logs in to an Itero server, keeps the session between runs, and sends
//! requests carrying the session credential.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use itero_core::{ApiClient, Config, LoginInfo, SessionManager};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Directory for rolling log files, when set
const LOG_DIR_ENV: &str = "ITERO_LOG_DIR";

/// Prefix of the daily log files
const LOG_FILE_PREFIX: &str = "itero.log";

const USAGE: &str = "\
Usage: itero <command>

Commands:
  login [user]   Log in (prompts for the password)
  logout         Close the session
  status         Show the current session
  url <base>     Print <base> with the session credential appended
  get <path>     GET <path> from the API with the session attached
  help           Show this message

Environment:
  ITERO_SERVER_URL   API base URL (overrides the config file)
  ITERO_LOG_DIR      Also write logs to daily files in this directory
  RUST_LOG           Log filter (default: warn)";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Login(Option<String>),
    Logout,
    Status,
    Url(String),
    Get(String),
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut args = args.iter().map(String::as_str);
    let command = match (args.next(), args.next()) {
        (None, _) | (Some("help" | "-h" | "--help"), _) => Command::Help,
        (Some("login"), user) => Command::Login(user.map(str::to_string)),
        (Some("logout" | "logoff"), None) => Command::Logout,
        (Some("status"), None) => Command::Status,
        (Some("url"), Some(base)) => Command::Url(base.to_string()),
        (Some("get"), Some(path)) => Command::Get(path.to_string()),
        (Some(other), _) => bail!("Unknown or incomplete command: {}\n\n{}", other, USAGE),
    };
    if args.next().is_some() {
        bail!("Too many arguments\n\n{}", USAGE);
    }
    Ok(command)
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).context("Failed to read input")?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No value entered");
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    if command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = Config::load()?;
    info!(server = %config.server_url, storage = ?config.storage, "Itero client starting");

    let session = Arc::new(SessionManager::new(config.credential_store()?));
    session.subscribe(|info| {
        if info.registered {
            info!(user = %info.user, "Session opened");
        } else {
            info!("Session closed");
        }
    });
    // Subscribed first so the restore is logged too
    session.check_session();

    let client = ApiClient::new(&config.server_url, Arc::clone(&session))?;

    match command {
        Command::Login(user) => {
            let user = match user.or_else(|| config.last_username.clone()) {
                Some(user) => user,
                None => prompt("Username: ")?,
            };
            let password = rpassword::prompt_password(format!("Password for {}: ", user))
                .context("Failed to read password")?;

            let user = client
                .login(&LoginInfo { user, password })
                .await
                .context("Login failed")?;

            config.last_username = Some(user.clone());
            if let Err(e) = config.save() {
                warn!(error = %e, "Failed to save config");
            }
            println!("Logged in as {}", user);
        }
        Command::Logout => {
            client.logoff();
            println!("Logged out");
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&session.current_info())?);
        }
        Command::Url(base) => {
            let url = if base.contains("://") {
                session.build_authenticated_url(&base)
            } else {
                client.authenticated_url(&base)?
            };
            println!("{}", url);
        }
        Command::Get(path) => {
            let body = client.get_text(&path).await?;
            println!("{}", body);
        }
        Command::Help => unreachable!("handled before loading the session"),
    }

    Ok(())
}
