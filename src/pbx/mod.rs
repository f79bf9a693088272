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

//! PBX control client: one long-lived WebSocket event subscription plus a
//! REST command surface, both against the same control plane. The event
//! loop triages `StasisStart` and forwards high-level decisions to the
//! orchestrator over an mpsc channel; low-level snoop/external-media
//! follow-up is handled here directly, since it never needs orchestrator
//! involvement.

pub mod commands;
pub mod events;

use crate::{
    config::{PbxConfig, RtpListenerConfig},
    error::{PbxError, PbxResult},
    pbx::events::{ChannelKind, StasisEvent, classify_channel},
    reconnect::{Backoff, BackoffPolicy, ReconnectManager},
    tracker::{CallState, ChannelTracker},
};
use futures_util::StreamExt;
use reqwest::Client;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug)]
pub enum PbxDispatch {
    AdmitCall {
        channel_id: String,
        correlation_id: String,
        patient_id: Option<String>,
    },
    CallEnded {
        channel_id: String,
        reason: String,
    },
}

/// Cheap-clone REST command handle, shared by the orchestrator and the
/// event loop.
#[derive(Clone)]
pub struct PbxClient {
    http: Client,
    config: PbxConfig,
}

impl PbxClient {
    pub fn new(config: PbxConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    pub async fn answer(&self, channel_id: &str) -> PbxResult<()> {
        commands::answer(&self.http, &self.config, channel_id).await
    }

    pub async fn hangup(&self, channel_id: &str) -> PbxResult<()> {
        commands::hangup(&self.http, &self.config, channel_id).await
    }

    pub async fn get_channel_var(
        &self,
        channel_id: &str,
        variable: &str,
    ) -> PbxResult<Option<String>> {
        commands::get_channel_var(&self.http, &self.config, channel_id, variable).await
    }

    pub async fn create_mixing_bridge(&self, name: &str) -> PbxResult<String> {
        commands::create_mixing_bridge(&self.http, &self.config, name).await
    }

    pub async fn add_channel_to_bridge(&self, bridge_id: &str, channel_id: &str) -> PbxResult<()> {
        commands::add_channel_to_bridge(&self.http, &self.config, bridge_id, channel_id).await
    }

    pub async fn record_bridge(&self, bridge_id: &str, recording_name: &str) -> PbxResult<()> {
        commands::record_bridge(&self.http, &self.config, bridge_id, recording_name).await
    }

    pub async fn destroy_bridge(&self, bridge_id: &str) -> PbxResult<()> {
        commands::destroy_bridge(&self.http, &self.config, bridge_id).await
    }

    pub async fn play_media(&self, channel_id: &str, media_ref: &str) -> PbxResult<String> {
        commands::play_media(&self.http, &self.config, channel_id, media_ref).await
    }

    pub async fn upload_sound(
        &self,
        sound_id: &str,
        format: &str,
        bytes: Vec<u8>,
    ) -> PbxResult<()> {
        commands::upload_sound(&self.http, &self.config, sound_id, format, bytes).await
    }

    /// Spawns a read-only snoop on `channel_id` under this client's own
    /// application, so the resulting `Snoop/*` channel lands back in our
    /// StasisStart handler for the external-media follow-up.
    pub async fn snoop_channel(&self, channel_id: &str) -> PbxResult<String> {
        commands::snoop_channel(&self.http, &self.config, channel_id, &self.config.application).await
    }
}

/// Key the single control-plane connection schedules itself under in the
/// shared [`ReconnectManager`] map; there is only ever one PBX control
/// client per process, so a fixed key is enough to dedupe reschedules.
const CONTROL_RECONNECT_KEY: &str = "pbx-control";

#[instrument(skip(subsys, tracker, dispatch_tx, control_ready, reconnect))]
pub async fn start_control_client(
    subsys: &tokio_graceful_shutdown::SubsystemHandle,
    config: PbxConfig,
    rtp_listener: RtpListenerConfig,
    tracker: Arc<ChannelTracker>,
    dispatch_tx: mpsc::Sender<PbxDispatch>,
    control_ready: Arc<AtomicBool>,
    reconnect: Arc<ReconnectManager>,
) -> PbxClient {
    let client = PbxClient::new(config.clone());
    let event_loop_client = client.clone();

    subsys.start(tokio_graceful_shutdown::SubsystemBuilder::new(
        "pbx-control-client",
        move |s| {
            run_event_loop(
                s,
                config,
                rtp_listener,
                event_loop_client,
                tracker,
                dispatch_tx,
                control_ready,
                reconnect,
            )
        },
    ));

    client
}

async fn run_event_loop(
    subsys: tokio_graceful_shutdown::SubsystemHandle,
    config: PbxConfig,
    rtp_listener: RtpListenerConfig,
    client: PbxClient,
    tracker: Arc<ChannelTracker>,
    dispatch_tx: mpsc::Sender<PbxDispatch>,
    control_ready: Arc<AtomicBool>,
    reconnect: Arc<ReconnectManager>,
) -> PbxResult<()> {
    let mut backoff = Backoff::new(BackoffPolicy {
        base: config.connect_backoff_base,
        factor: config.connect_backoff_factor,
        cap: config.connect_backoff_cap,
        max_attempts: config.connect_max_attempts,
    });

    let ws_url = format!(
        "{}?app={}",
        config.websocket_url.trim_end_matches('/'),
        config.application
    );

    loop {
        tokio::select! {
            connected = connect_async(&ws_url) => {
                match connected {
                    Ok((ws, _)) => {
                        backoff.reset();
                        if commands::subscribe_application(&client.http, &config, &config.application).await.is_ok() {
                            control_ready.store(true, Ordering::Relaxed);
                        }
                        handle_connection(&subsys, ws, &config, &rtp_listener, &client, &tracker, &dispatch_tx).await;
                        control_ready.store(false, Ordering::Relaxed);
                    }
                    Err(e) => warn!(error = %e, "pbx control plane connect failed"),
                }
            }
            _ = subsys.on_shutdown_requested() => return Ok(()),
        }

        match backoff.next_delay() {
            Some(delay) => {
                let attempt = backoff.attempts();
                if let Some(rx) = reconnect.schedule(CONTROL_RECONNECT_KEY.to_owned(), delay, attempt) {
                    let _ = rx.await;
                }
            }
            None => return Err(PbxError::ReconnectExhausted),
        }
    }
}

async fn handle_connection(
    subsys: &tokio_graceful_shutdown::SubsystemHandle,
    mut ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &PbxConfig,
    rtp_listener: &RtpListenerConfig,
    client: &PbxClient,
    tracker: &Arc<ChannelTracker>,
    dispatch_tx: &mpsc::Sender<PbxDispatch>,
) {
    loop {
        tokio::select! {
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_event(&text, config, rtp_listener, client, tracker, dispatch_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "pbx control plane websocket error");
                        return;
                    }
                }
            }
            _ = subsys.on_shutdown_requested() => return,
        }
    }
}

async fn handle_event(
    text: &str,
    config: &PbxConfig,
    rtp_listener: &RtpListenerConfig,
    client: &PbxClient,
    tracker: &Arc<ChannelTracker>,
    dispatch_tx: &mpsc::Sender<PbxDispatch>,
) {
    let event: StasisEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            warn!(error = %e, "malformed control plane event");
            return;
        }
    };

    match event {
        StasisEvent::StasisStart { channel, .. } => {
            handle_stasis_start(channel, config, rtp_listener, client, tracker, dispatch_tx).await;
        }
        StasisEvent::StasisEnd { channel }
        | StasisEvent::ChannelDestroyed { channel }
        | StasisEvent::ChannelHangupRequest { channel } => {
            handle_channel_ended(channel, tracker, dispatch_tx).await;
        }
        StasisEvent::ChannelDtmfReceived { channel, digit } => {
            info!(channel_id = %channel.id, %digit, "dtmf received");
        }
        StasisEvent::ChannelTalkingStarted { .. } | StasisEvent::ChannelTalkingFinished { .. } => {}
        StasisEvent::Other => {}
    }
}

async fn handle_stasis_start(
    channel: events::ChannelRef,
    config: &PbxConfig,
    rtp_listener: &RtpListenerConfig,
    client: &PbxClient,
    tracker: &Arc<ChannelTracker>,
    dispatch_tx: &mpsc::Sender<PbxDispatch>,
) {
    match classify_channel(&channel.name, &config.trunk_channel_prefix) {
        ChannelKind::Snoop => {
            let Some(parent_channel_id) = tracker.find_by_snoop_channel(&channel.id).await else {
                return;
            };

            let send_format = match rtp_listener.send_format {
                crate::config::AudioSendFormat::Ulaw => "ulaw",
                crate::config::AudioSendFormat::Slin => "slin16",
            };

            if let Err(e) = client.answer(&channel.id).await {
                warn!(channel_id = %channel.id, error = %e, "snoop answer failed");
            }

            let external_media_result = commands::external_media(
                &client.http,
                &client.config,
                &channel.id,
                &rtp_listener.bind_address.to_string(),
                rtp_listener.port,
                send_format,
                &config.application,
            )
            .await;

            if let Err(e) = external_media_result {
                warn!(channel_id = %channel.id, error = %e, "external media setup failed, cascading cleanup");
                let _ = dispatch_tx
                    .send(PbxDispatch::CallEnded {
                        channel_id: parent_channel_id,
                        reason: "external_media_setup_failed".to_owned(),
                    })
                    .await;
                return;
            }

            tracker
                .update(&parent_channel_id, |r| {
                    r.advance_state(CallState::AwaitingAiSession)
                })
                .await;
        }
        ChannelKind::Trunk => {
            let correlation_id = client
                .get_channel_var(&channel.id, "CORRELATION_ID")
                .await
                .ok()
                .flatten();
            let patient_id = client
                .get_channel_var(&channel.id, "PATIENT_ID")
                .await
                .ok()
                .flatten();
            let audio_socket_uuid = client
                .get_channel_var(&channel.id, "AUDIOSOCKET_UUID")
                .await
                .ok()
                .flatten()
                .and_then(|v| v.parse::<Uuid>().ok());

            let (Some(correlation_id), Some(patient_id)) = (correlation_id, patient_id) else {
                warn!(channel_id = %channel.id, "missing CORRELATION_ID or PATIENT_ID, hanging up");
                let _ = client.hangup(&channel.id).await;
                return;
            };

            if tracker
                .admit(channel.id.clone(), correlation_id.clone(), Some(patient_id.clone()))
                .is_err()
            {
                warn!(channel_id = %channel.id, "duplicate channel admission, hanging up");
                let _ = client.hangup(&channel.id).await;
                return;
            }

            if let Some(uuid) = audio_socket_uuid {
                tracker.bind_uuid(&channel.id, uuid).await;
            }

            if client.answer(&channel.id).await.is_err() {
                warn!(channel_id = %channel.id, "answer failed during admission");
            }

            let _ = dispatch_tx
                .send(PbxDispatch::AdmitCall {
                    channel_id: channel.id,
                    correlation_id,
                    patient_id: Some(patient_id),
                })
                .await;
        }
        ChannelKind::InternalTransport => {}
        ChannelKind::Unknown => {
            let _ = client.hangup(&channel.id).await;
        }
    }
}

async fn handle_channel_ended(
    channel: events::ChannelRef,
    tracker: &Arc<ChannelTracker>,
    dispatch_tx: &mpsc::Sender<PbxDispatch>,
) {
    if tracker.get(&channel.id).is_some() {
        let _ = dispatch_tx
            .send(PbxDispatch::CallEnded {
                channel_id: channel.id,
                reason: "stasis_end".to_owned(),
            })
            .await;
        return;
    }

    if let Some(parent_channel_id) = tracker.find_by_snoop_channel(&channel.id).await {
        tracker
            .update(&parent_channel_id, |r| {
                r.resources.snoop_channel_handle = None;
            })
            .await;
    }
}
