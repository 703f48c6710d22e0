//! Documentation of a hospital bedside patient-engagement backend.
//!
//! Serves the bedside TV dashboard and the patient's own phone. Staff hand out QR codes, the
//! patient scans them to register, view their record, or leave feedback.
//!
//!
//!
//! # General Infrastructure
//! - One process, one axum server, JSON over HTTP
//! - Frontend runs on the bedside TV (or the kiosk shell around it) and talks to this server
//! - Patient phones only ever reach the server through a token URL
//! - Patients persist in Redis when configured, otherwise in memory
//! - Tokens always live in memory, a restart discards them
//!
//!
//!
//! # Tokens
//!
//! **Goal**: Give a patient's own device time-limited access to one action without accounts or
//! passwords. See [`tokens`] for the lifecycle.
//!
//! - Staff request a token, the server answers with the URL and a QR code of it
//! - Patient scans, the frontend asks the server whether the token is valid
//! - Unknown and expired tokens get the same 404, nobody learns which one it was
//! - Registration tokens are single use and turn into a patient record, see [`registration`]
//! - Patient access and feedback tokens stay readable until they expire after 24 hours
//!
//!
//!
//! # Endpoints
//!
//! | Method | Path | |
//! |---|---|---|
//! | POST | `/api/registration/token` | issue, optional prefill body |
//! | GET | `/api/registration/validate/{token}` | `{ valid, prefilledData }` |
//! | POST | `/api/registration/submit/{token}` | form body, `{ success, patient }` |
//! | GET | `/api/patients/{id}/access-token` | issue for an existing patient |
//! | GET | `/api/patient-access/{token}` | `{ valid, patient }` |
//! | POST | `/api/feedback/token` | issue, optional `{ patientId }` |
//! | GET | `/api/feedback/validate/{token}` | `{ valid, patientData }` |
//! | POST | `/api/feedback` | tokenless feedback |
//! | GET, POST | `/api/patients` | list, create |
//! | GET, PUT, DELETE | `/api/patients/{id}` | read, update, discharge |
//! | GET | `/health` | liveness |
//!
//!
//!
//! # Notes
//!
//! ## Privacy
//! Names are reduced to initials before anything is stored. `"John Smith"` is kept as `"J.S."`.
//! The bedside screen is visible to every visitor in the room.
//!
//! ## Memory
//! Expired tokens are evicted when touched. Tokens nobody touches again are dropped by the
//! periodic sweep (`TOKEN_SWEEP_SECS`, default hourly).
//!
//!
//!
//! # Setup
//!
//! Run locally with debug logs.
//! ```sh
//! RUST_LOG=debug cargo run -p bedside
//! ```
//!
//! Run against Redis.
//! ```sh
//! REDIS_URL=redis://127.0.0.1:6379 cargo run -p bedside
//! ```
//!
//! Generate docs in `target/doc/server/index.html`.
//! ```sh
//! cargo doc
//! ```
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{
    net::TcpListener,
    signal,
    time::{MissedTickBehavior, interval},
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

pub mod config;
pub mod database;
pub mod error;
pub mod patients;
pub mod qr;
pub mod registration;
pub mod routes;
pub mod state;
pub mod tokens;
pub mod utils;

use routes::{
    create_patient_handler, delete_patient_handler, get_patient_handler, health_handler,
    issue_feedback_handler, issue_patient_access_handler, issue_registration_handler,
    list_patients_handler, submit_feedback_handler, submit_registration_handler,
    update_patient_handler, validate_feedback_handler, validate_patient_access_handler,
    validate_registration_handler,
};
use state::State;

pub fn app(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([CONTENT_TYPE])
        .max_age(state.config.cors_max_age);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/registration/token", post(issue_registration_handler))
        .route(
            "/api/registration/validate/{token}",
            get(validate_registration_handler),
        )
        .route(
            "/api/registration/submit/{token}",
            post(submit_registration_handler),
        )
        .route(
            "/api/patients",
            get(list_patients_handler).post(create_patient_handler),
        )
        .route(
            "/api/patients/{id}",
            get(get_patient_handler)
                .put(update_patient_handler)
                .delete(delete_patient_handler),
        )
        .route(
            "/api/patients/{id}/access-token",
            get(issue_patient_access_handler),
        )
        .route(
            "/api/patient-access/{token}",
            get(validate_patient_access_handler),
        )
        .route("/api/feedback", post(submit_feedback_handler))
        .route("/api/feedback/token", post(issue_feedback_handler))
        .route(
            "/api/feedback/validate/{token}",
            get(validate_feedback_handler),
        )
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = State::new().await?;

    spawn_sweeper(state.clone());

    info!("Starting server...");

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shut down");

    Ok(())
}

fn spawn_sweeper(state: Arc<State>) {
    let period = state.config.sweep_interval;

    if period.is_zero() {
        warn!("Token sweep disabled, expired tokens are only evicted on lookup");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let removed = state.tokens.sweep();
            if removed > 0 {
                info!(removed, "Swept expired tokens");
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
