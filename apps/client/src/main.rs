mod config;
mod credentials;
mod errors;
mod login;
mod models;
mod realtime;
mod state;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::credentials::EnvCredentials;
use crate::login::{LoginFlowState, LoginSnapshot};
use crate::models::delivery::{
    DeliveryProgressMessage, DeliveryRecordMessage, DeliveryStatusMessage, ErrorMessage,
    SuccessMessage, VerificationCodeMessage,
};
use crate::models::login::QrArtifact;
use crate::models::Topic;
use crate::realtime::{ConnectionEvent, Subscription};
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Watch,
    Login,
}

impl Command {
    fn parse(arg: Option<&str>) -> Result<Self> {
        match arg {
            None | Some("watch") => Ok(Command::Watch),
            Some("login") => Ok(Command::Login),
            Some(other) => bail!("Unknown command '{other}'. Usage: delivery-sync [watch|login]"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting delivery-sync v{}", env!("CARGO_PKG_VERSION"));

    let arg = std::env::args().nth(1);
    let command = Command::parse(arg.as_deref())?;

    let state = AppState::build(config, Arc::new(EnvCredentials))?;

    match command {
        Command::Watch => watch(state).await,
        Command::Login => {
            let outcome = login(state).await?;
            if outcome != LoginFlowState::Success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Streams delivery updates to the log until Ctrl-C.
async fn watch(state: AppState) -> Result<()> {
    let conn = state.connection.clone();
    let _subscriptions = subscribe_all(&state);

    let mut events = conn.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected) => info!("Realtime sync online"),
                Ok(ConnectionEvent::Closed { code, reason }) => {
                    info!("Realtime sync offline ({code}: {reason})")
                }
                Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                    info!("Retrying in {}ms (attempt {attempt})", delay.as_millis())
                }
                Ok(ConnectionEvent::ReconnectExhausted { attempts }) => {
                    error!("Gave up after {attempts} reconnect attempts; restart to try again")
                }
                Ok(ConnectionEvent::AuthRejected { code, reason }) => {
                    error!("Token rejected ({code}: {reason}); log in again and restart")
                }
                Err(RecvError::Lagged(skipped)) => warn!("Missed {skipped} connection events"),
                Err(RecvError::Closed) => return,
            }
        }
    });

    conn.connect()
        .await
        .context("Could not open the realtime connection")?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    conn.disconnect();
    Ok(())
}

fn subscribe_all(state: &AppState) -> Vec<Subscription> {
    let conn = &state.connection;
    vec![
        conn.subscribe_typed(Topic::Status, |msg: DeliveryStatusMessage| {
            info!(
                running = msg.is_running,
                delivered = msg.total_delivered,
                ok = msg.successful_delivered,
                failed = msg.failed_delivered,
                "Delivery status: {}",
                msg.current_job.as_deref().unwrap_or("idle")
            );
            Ok(())
        }),
        conn.subscribe_typed(Topic::Progress, |msg: DeliveryProgressMessage| {
            info!(
                "Progress {}/{} ({:.1}%), ~{}s remaining",
                msg.processed_jobs,
                msg.total_jobs,
                msg.progress_percentage,
                msg.estimated_time_remaining
            );
            Ok(())
        }),
        conn.subscribe_typed(Topic::Record, |msg: DeliveryRecordMessage| {
            let record = msg.record;
            info!(
                "Delivered to {} @ {}: {:?}",
                record.job_title, record.company_name, record.status
            );
            Ok(())
        }),
        conn.subscribe_typed(Topic::Error, |msg: ErrorMessage| {
            error!("Delivery error: {}", msg.message);
            Ok(())
        }),
        conn.subscribe_typed(Topic::Success, |msg: SuccessMessage| {
            info!("{}", msg.message);
            Ok(())
        }),
        conn.subscribe_typed(
            Topic::VerificationCodeRequired,
            |msg: VerificationCodeMessage| {
                warn!(
                    request_id = %msg.request_id,
                    "Verification code required for '{}'",
                    msg.job_name
                );
                Ok(())
            },
        ),
    ]
}

/// Runs one scan-to-login flow, writing each new code image to disk.
/// Returns the terminal status.
async fn login(state: AppState) -> Result<LoginFlowState> {
    let flow = state.login.clone();
    let mut updates = flow.watch();

    flow.start().await.context("Could not start the login flow")?;

    let mut written: Option<String> = None;
    loop {
        let snapshot: LoginSnapshot = updates.borrow_and_update().clone();

        if let Some(artifact) = &snapshot.artifact {
            if written.as_deref() != Some(artifact.data_uri()) {
                save_artifact(&state.config.qr_output_path, artifact).await?;
                info!("Scan the code saved at {}", state.config.qr_output_path);
                written = Some(artifact.data_uri().to_string());
            }
        }

        match snapshot.status {
            LoginFlowState::Success => {
                info!("Login complete");
                // Let the settle delay run so the display closes on its own.
                while updates.borrow().visible {
                    if updates.changed().await.is_err() {
                        break;
                    }
                }
                return Ok(LoginFlowState::Success);
            }
            LoginFlowState::Failed => {
                error!("Login failed; run `delivery-sync login` again for a fresh code");
                flow.close();
                return Ok(LoginFlowState::Failed);
            }
            LoginFlowState::NotStarted if !snapshot.visible => {
                return Ok(LoginFlowState::NotStarted);
            }
            _ => {}
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(flow.status());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Login cancelled");
                flow.close();
                return Ok(flow.status());
            }
        }
    }
}

async fn save_artifact(path: &str, artifact: &QrArtifact) -> Result<()> {
    let png = artifact
        .decode_png()
        .context("Login code is not valid base64")?;
    tokio::fs::write(path, png)
        .await
        .with_context(|| format!("Could not write {path}"))
}
