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

use call_media_bridge::{
    admin::start_admin_server,
    ai::AiRegistry,
    config::{Config, IngressStrategy},
    egress::RtpEgress,
    error::{CallBridgeError, ToBoxedResult},
    ingress::start_audio_socket_listener,
    orchestrator::Orchestrator,
    pbx::start_control_client,
    reconnect::ReconnectManager,
    telemetry,
    tracker::ChannelTracker,
    transcript::TranscriptSink,
};
// `Config::load`/`telemetry::init` return plain `Diagnostic` error types and
// convert straight into `miette::Result` via `?`; `ToBoxedResult::boxed` is
// only needed inside `run`, which aggregates into `CallBridgeError`'s boxed
// variants.
use miette::Result;
use std::{
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    telemetry::init(&config).await?;

    info!(
        "Starting {} instance '{}'",
        config.app.name,
        config.instance_name()
    );

    let tracker = Arc::new(ChannelTracker::new());
    let ai = Arc::new(AiRegistry::new());
    let egress = Arc::new(RtpEgress::new());
    let transcript = TranscriptSink::new(config.transcript.base_url.clone());
    let control_ready = Arc::new(AtomicBool::new(false));
    let reconnect = Arc::new(ReconnectManager::new());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("call-media-bridge", move |s| {
            run(
                s,
                config,
                tracker,
                ai,
                egress,
                transcript,
                control_ready,
                reconnect,
            )
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(1))
    .await?;

    Ok(())
}

async fn run(
    subsys: tokio_graceful_shutdown::SubsystemHandle,
    config: Config,
    tracker: Arc<ChannelTracker>,
    ai: Arc<AiRegistry>,
    egress: Arc<RtpEgress>,
    transcript: TranscriptSink,
    control_ready: Arc<AtomicBool>,
    reconnect: Arc<ReconnectManager>,
) -> Result<(), CallBridgeError> {
    let (pbx_dispatch_tx, pbx_dispatch_rx) = mpsc::channel(256);
    let (ai_notify_tx, ai_notify_rx) = mpsc::channel(256);

    let pbx = start_control_client(
        &subsys,
        config.pbx.clone(),
        config.rtp_listener.clone(),
        tracker.clone(),
        pbx_dispatch_tx,
        control_ready.clone(),
        reconnect.clone(),
    )
    .await;

    if config.ingress_strategy == IngressStrategy::AudioSocket {
        let bind_address = SocketAddr::new(config.audio_socket.bind_address, config.audio_socket.port);
        start_audio_socket_listener(&subsys, bind_address, tracker.clone(), ai.clone())
            .await
            .boxed()?;
    }

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        pbx,
        ai,
        tracker.clone(),
        transcript,
        ai_notify_tx,
        egress,
        reconnect,
    ));

    start_admin_server(
        &subsys,
        config.admin.clone(),
        tracker,
        orchestrator.clone(),
        control_ready,
    );

    orchestrator.run(subsys, pbx_dispatch_rx, ai_notify_rx).await;

    Ok(())
}
