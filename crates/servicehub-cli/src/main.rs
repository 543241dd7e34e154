//! servicehub - command-line front end for the marketplace session client.
//!
//! Useful for checking a backend's auth endpoints and for inspecting or
//! clearing the session stored in the OS keychain.

use std::io::{self, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use servicehub_core::{ApiClient, ApiError, Config, CredentialStore, Role, SessionManager};

#[derive(Parser)]
#[command(name = "servicehub", version, about = "Marketplace session client")]
struct Cli {
    /// Override the API base URL for this run
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and store the session in the keychain
    Login {
        /// Account email (defaults to the last one used)
        #[arg(long)]
        email: Option<String>,
    },
    /// Sign out and clear the stored session
    Logout,
    /// Show who is signed in
    Whoami,
    /// Show where a screen requiring ROLE would send the current user
    Guard {
        /// consumer or provider
        role: Role,
    },
    /// Send a password reset email
    ResetPassword { email: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let mut config = Config::load()?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    info!(api = %config.api_base_url, "servicehub starting");

    let credentials = CredentialStore::keyring(&config.keyring_service);
    let api = ApiClient::new(&config, credentials)?;
    let session = SessionManager::new(api);

    match cli.command {
        Command::Login { email } => login(&session, &mut config, email).await,
        Command::Logout => {
            session.logout().await;
            println!("Signed out.");
            Ok(())
        }
        Command::Whoami => {
            let state = session.bootstrap().await;
            println!("{}", state);
            if state.is_anonymous() {
                if let Some(cached) = session.cached_identity().await {
                    println!(
                        "Last signed in as {} ({}m ago)",
                        cached.identity.email(),
                        cached.age_minutes()
                    );
                }
            }
            Ok(())
        }
        Command::Guard { role } => {
            session.bootstrap().await;
            let decision = session.guard(Some(role));
            match decision.target() {
                Some(route) => println!("{:?} -> {}", decision, route),
                None => println!("{:?}", decision),
            }
            Ok(())
        }
        Command::ResetPassword { email } => {
            session
                .request_password_reset(&email)
                .await
                .map_err(report)?;
            println!("If an account exists for {}, a reset link is on its way.", email);
            Ok(())
        }
    }
}

async fn login(session: &SessionManager, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    let identity = session.login(&email, &password).await.map_err(report)?;

    config.last_email = Some(email);
    if let Err(e) = config.save() {
        tracing::warn!(error = %e, "Failed to save config");
    }

    println!(
        "Signed in as {} (#{}, {}).",
        identity.email(),
        identity.id(),
        identity.role()
    );
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

/// Turn API errors into messages a person can act on.
fn report(err: ApiError) -> anyhow::Error {
    match err {
        ApiError::Validation(fields) => {
            let lines: Vec<String> = fields
                .into_inner()
                .into_iter()
                .map(|(field, messages)| format!("  {}: {}", field, messages.join(" ")))
                .collect();
            anyhow::anyhow!("Request rejected:\n{}", lines.join("\n"))
        }
        ApiError::NetworkUnavailable(detail) => {
            anyhow::anyhow!("Cannot reach the server, try again ({})", detail)
        }
        other => other.into(),
    }
}
