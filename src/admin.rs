/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Operability surface: a read-only projection of the tracker plus an
//! operator-initiated hangup. No auth model — bind it to loopback or an
//! internal network only, same as the teacher's own webserver.

use crate::{
    config::AdminConfig,
    orchestrator::Orchestrator,
    tracker::{CallRecord, CallState, ChannelTracker},
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::net::TcpListener;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

#[derive(Clone)]
struct AdminState {
    tracker: Arc<ChannelTracker>,
    orchestrator: Arc<Orchestrator>,
    control_ready: Arc<AtomicBool>,
}

#[derive(Debug, Serialize)]
struct AdminSnapshot {
    channel_id: String,
    correlation_id: String,
    patient_id: Option<String>,
    state: &'static str,
    conversation_id: Option<String>,
    start_time: u64,
    last_activity: u64,
}

impl From<CallRecord> for AdminSnapshot {
    fn from(record: CallRecord) -> Self {
        Self {
            channel_id: record.channel_id,
            correlation_id: record.correlation_id,
            patient_id: record.patient_id,
            state: call_state_label(record.state),
            conversation_id: record.conversation_id,
            start_time: record.start_time,
            last_activity: record.last_activity,
        }
    }
}

fn call_state_label(state: CallState) -> &'static str {
    match state {
        CallState::Admitted => "admitted",
        CallState::Answered => "answered",
        CallState::PipelineSetup => "pipeline_setup",
        CallState::MediaBridged => "media_bridged",
        CallState::AwaitingAiSession => "awaiting_ai_session",
        CallState::Streaming => "streaming",
        CallState::Terminating => "terminating",
        CallState::Terminated => "terminated",
    }
}

#[instrument(skip(subsys, tracker, orchestrator, control_ready))]
pub fn start_admin_server(
    subsys: &SubsystemHandle,
    config: AdminConfig,
    tracker: Arc<ChannelTracker>,
    orchestrator: Arc<Orchestrator>,
    control_ready: Arc<AtomicBool>,
) {
    info!("starting admin subsystem");
    subsys.start(SubsystemBuilder::new("admin-server", move |s| {
        run_admin_server(s, config, tracker, orchestrator, control_ready)
    }));
}

async fn run_admin_server(
    subsys: SubsystemHandle,
    config: AdminConfig,
    tracker: Arc<ChannelTracker>,
    orchestrator: Arc<Orchestrator>,
    control_ready: Arc<AtomicBool>,
) -> Result<(), std::io::Error> {
    let state = AdminState {
        tracker,
        orchestrator,
        control_ready,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/calls", get(list_calls))
        .route("/calls/{channel_id}", get(get_call))
        .route("/calls/{channel_id}/hangup", post(hangup_call))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let bind_address = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "admin server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { subsys.on_shutdown_requested().await })
        .await
}

async fn healthz(State(state): State<AdminState>) -> StatusCode {
    if state.control_ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn list_calls(State(state): State<AdminState>) -> Json<Vec<AdminSnapshot>> {
    let snapshots = state
        .tracker
        .snapshot_all()
        .await
        .into_iter()
        .map(AdminSnapshot::from)
        .collect();
    Json(snapshots)
}

async fn get_call(
    State(state): State<AdminState>,
    Path(channel_id): Path<String>,
) -> Result<Json<AdminSnapshot>, StatusCode> {
    match state.tracker.snapshot(&channel_id).await {
        Some(record) => Ok(Json(AdminSnapshot::from(record))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn hangup_call(
    State(state): State<AdminState>,
    Path(channel_id): Path<String>,
) -> StatusCode {
    if state.tracker.get(&channel_id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state
        .orchestrator
        .cleanup(&channel_id, "admin_requested_hangup")
        .await;
    StatusCode::OK
}
