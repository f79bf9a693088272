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

//! Media pipeline orchestrator: binds the control client, the AI client and
//! the tracker together for a single call. Owns `setupMediaPipeline`, the
//! AI-audio playback path, and the cleanup DAG. Runs as one subsystem task
//! draining a single mpsc channel fed by the PBX and AI components —
//! there is no per-call task here, only per-call state inside the tracker.

use crate::{
    ai::{AiNotification, AiRegistry},
    config::{Config, IngressStrategy},
    egress::RtpEgress,
    pbx::PbxDispatch,
    pbx::PbxClient,
    reconnect::ReconnectManager,
    tracker::{CallState, ChannelTracker},
    transcript::TranscriptSink,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::{sync::Arc, time::{SystemTime, UNIX_EPOCH}};
use tokio::sync::mpsc;
use tokio_graceful_shutdown::SubsystemHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub struct Orchestrator {
    config: Config,
    pbx: PbxClient,
    ai: Arc<AiRegistry>,
    tracker: Arc<ChannelTracker>,
    transcript: TranscriptSink,
    /// Handed to every per-call `AiConnection` so its notifications land on
    /// the single shared channel this orchestrator drains in `run`, rather
    /// than spawning a forwarder task per call.
    ai_notify_tx: mpsc::Sender<AiNotification>,
    /// Used as the playback path instead of ARI upload+play when the
    /// deployment is configured with a fixed RTP egress target.
    egress: Arc<RtpEgress>,
    /// Shared C8 scheduler handed to every per-call `AiConnection`.
    reconnect: Arc<ReconnectManager>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        pbx: PbxClient,
        ai: Arc<AiRegistry>,
        tracker: Arc<ChannelTracker>,
        transcript: TranscriptSink,
        ai_notify_tx: mpsc::Sender<AiNotification>,
        egress: Arc<RtpEgress>,
        reconnect: Arc<ReconnectManager>,
    ) -> Self {
        Self {
            config,
            pbx,
            ai,
            tracker,
            transcript,
            ai_notify_tx,
            egress,
            reconnect,
        }
    }

    #[instrument(skip(self, subsys, pbx_dispatch, ai_notifications))]
    pub async fn run(
        self: Arc<Self>,
        subsys: SubsystemHandle,
        mut pbx_dispatch: mpsc::Receiver<PbxDispatch>,
        mut ai_notifications: mpsc::Receiver<AiNotification>,
    ) {
        loop {
            tokio::select! {
                Some(dispatch) = pbx_dispatch.recv() => self.handle_pbx_dispatch(dispatch).await,
                Some(notification) = ai_notifications.recv() => self.handle_ai_notification(notification).await,
                _ = subsys.on_shutdown_requested() => break,
                else => break,
            }
        }
    }

    async fn handle_pbx_dispatch(&self, dispatch: PbxDispatch) {
        match dispatch {
            PbxDispatch::AdmitCall {
                channel_id,
                correlation_id,
                patient_id,
            } => {
                self.setup_media_pipeline(channel_id, correlation_id, patient_id)
                    .await;
            }
            PbxDispatch::CallEnded { channel_id, reason } => {
                self.cleanup(&channel_id, &reason).await;
            }
        }
    }

    async fn handle_ai_notification(&self, notification: AiNotification) {
        match notification {
            AiNotification::SessionReady { channel_id } => {
                self.tracker
                    .update(&channel_id, |r| r.advance_state(CallState::Streaming))
                    .await;
            }
            AiNotification::AudioChunk {
                channel_id,
                mulaw_base64,
            } => {
                self.play_audio_chunk(&channel_id, &mulaw_base64).await;
            }
            AiNotification::TextMessage {
                channel_id,
                conversation_id,
                role,
                content,
            } => {
                if let Some(conversation_id) = conversation_id {
                    if let Err(e) = self
                        .transcript
                        .append_message(&conversation_id, &role, &content)
                        .await
                    {
                        warn!(channel_id, error = %e, "transcript append failed");
                    }
                }
            }
            AiNotification::FunctionCall {
                channel_id,
                call_id,
                name,
                arguments,
            } => {
                info!(channel_id, call_id, name, arguments, "ai function call received");
            }
            AiNotification::MaxReconnectFailed { channel_id } => {
                warn!(channel_id, "ai reconnect budget exhausted");
                self.cleanup(&channel_id, "ai_reconnect_exhausted").await;
            }
            AiNotification::Closed { channel_id } => {
                info!(channel_id, "ai connection closed");
            }
        }
    }

    #[instrument(skip(self))]
    async fn setup_media_pipeline(
        &self,
        channel_id: String,
        correlation_id: String,
        patient_id: Option<String>,
    ) {
        let now = monotonic_millis();
        let conversation_id = self
            .transcript
            .find_or_create_conversation(&channel_id, patient_id.as_deref(), now)
            .await;
        if let Some(conversation_id) = &conversation_id {
            self.tracker
                .update(&channel_id, |r| {
                    r.conversation_id = Some(conversation_id.clone());
                })
                .await;
        }

        self.tracker
            .update(&channel_id, |r| r.advance_state(CallState::PipelineSetup))
            .await;

        let bridge_name = format!("call-{channel_id}");
        let bridge_id = match self.pbx.create_mixing_bridge(&bridge_name).await {
            Ok(id) => id,
            Err(e) => {
                warn!(channel_id, error = %e, "mixing bridge creation failed, aborting call");
                self.cleanup(&channel_id, "bridge_create_failed").await;
                return;
            }
        };
        self.tracker
            .update(&channel_id, |r| {
                r.resources.main_bridge_handle = Some(bridge_id.clone());
            })
            .await;

        let recording_name = format!("rec-{channel_id}");
        if let Err(e) = self.pbx.record_bridge(&bridge_id, &recording_name).await {
            warn!(channel_id, error = %e, "bridge recording failed, continuing without it");
        } else {
            self.tracker
                .update(&channel_id, |r| {
                    r.recording_name = Some(recording_name.clone());
                })
                .await;
        }

        if let Err(e) = self.pbx.add_channel_to_bridge(&bridge_id, &channel_id).await {
            warn!(channel_id, error = %e, "adding main channel to bridge failed, aborting call");
            self.cleanup(&channel_id, "bridge_add_failed").await;
            return;
        }

        self.tracker
            .update(&channel_id, |r| r.advance_state(CallState::MediaBridged))
            .await;

        self.ai.initialize(
            self.config.ai.clone(),
            channel_id.clone(),
            correlation_id.clone(),
            self.config.ai.initial_prompt.clone(),
            self.ai_notify_tx.clone(),
            self.tracker.clone(),
            self.reconnect.clone(),
        );

        match self.config.ingress_strategy {
            IngressStrategy::SnoopExternalMedia => {
                if let Err(e) = self.pbx.answer(&channel_id).await {
                    warn!(channel_id, error = %e, "answer before snoop failed");
                }
                if let Some(target) = self.config.rtp_listener.egress_target {
                    if let Err(e) = self
                        .egress
                        .initialize(&correlation_id, target, self.config.rtp_listener.send_format)
                        .await
                    {
                        warn!(channel_id, error = %e, "rtp egress init failed, playback falls back to ARI");
                    }
                }
                self.start_snoop(&channel_id, &bridge_id).await;
            }
            IngressStrategy::AudioSocket => {
                // C4 correlates this call by UUID on first frame; nothing to
                // do here beyond waiting for that handshake.
                info!(channel_id, "awaiting audio-socket uuid handshake");
            }
        }
    }

    /// Creates the snoop channel tapping `channel_id`'s audio; the PBX
    /// control client's own StasisStart handler picks up the resulting
    /// `Snoop/*` channel and issues the `externalMedia` follow-up.
    async fn start_snoop(&self, channel_id: &str, _bridge_id: &str) {
        match self.pbx.snoop_channel(channel_id).await {
            Ok(snoop_channel_id) => {
                self.tracker
                    .update(channel_id, |r| {
                        r.resources.snoop_channel_handle = Some(snoop_channel_id);
                    })
                    .await;
            }
            Err(e) => {
                warn!(channel_id, error = %e, "snoop creation failed, aborting call");
                self.cleanup(channel_id, "snoop_create_failed").await;
            }
        }
    }

    /// Playback path: decode, then either send as outbound RTP (when this
    /// deployment has a fixed egress target configured) or hand to the
    /// control client as a PBX play command, uploading a fresh sound asset.
    #[instrument(skip(self, mulaw_base64))]
    async fn play_audio_chunk(&self, channel_id: &str, mulaw_base64: &str) {
        if BASE64.decode(mulaw_base64).is_err() {
            warn!(channel_id, "malformed ai audio chunk, dropping");
            return;
        }

        if self.config.rtp_listener.egress_target.is_some() {
            if let Some(record) = self.tracker.get(channel_id) {
                let correlation_id = record.lock().await.correlation_id.clone();
                if let Err(e) = self.egress.send_audio(&correlation_id, mulaw_base64).await {
                    warn!(channel_id, error = %e, "rtp egress send failed");
                }
                return;
            }
        }

        let Ok(mulaw_bytes) = BASE64.decode(mulaw_base64) else {
            return;
        };

        let sound_id = format!("ai-{}", Uuid::new_v4());
        match self
            .pbx
            .upload_sound(&sound_id, "ulaw", mulaw_bytes.clone())
            .await
        {
            Ok(()) => {
                if let Err(e) = self
                    .pbx
                    .play_media(channel_id, &format!("sound:{sound_id}"))
                    .await
                {
                    warn!(channel_id, error = %e, "playback failed after upload");
                }
            }
            Err(e) => {
                warn!(channel_id, error = %e, "sound upload failed, falling back to temp file playback");
                self.play_from_temp_file(channel_id, &mulaw_bytes).await;
            }
        }
    }

    /// Fallback for when `upload_sound` fails: writes the µ-law chunk to a
    /// temp file and plays it directly by path (`sound:!<path>`, the ARI
    /// convention for an absolute filesystem reference instead of a sound
    /// id). The file is removed once playback has been kicked off.
    async fn play_from_temp_file(&self, channel_id: &str, mulaw_bytes: &[u8]) {
        let tmp = match tempfile::Builder::new()
            .prefix("ai-audio-")
            .suffix(".ulaw")
            .tempfile()
        {
            Ok(f) => f,
            Err(e) => {
                warn!(channel_id, error = %e, "temp file creation failed, dropping chunk");
                return;
            }
        };
        let path = tmp.path().to_path_buf();
        if let Err(e) = tokio::fs::write(&path, mulaw_bytes).await {
            warn!(channel_id, error = %e, "temp file write failed, dropping chunk");
            return;
        }
        let media_ref = format!("sound:!{}", path.display());
        if let Err(e) = self.pbx.play_media(channel_id, &media_ref).await {
            warn!(channel_id, error = %e, "playback from temp file failed");
        }
        drop(tmp);
    }

    /// Idempotent cleanup DAG: runs once per call and is a no-op on any
    /// subsequent invocation because `tracker.remove` returns `None`.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, channel_id: &str, reason: &str) {
        let Some(record) = self.tracker.remove(channel_id).await else {
            return;
        };

        info!(channel_id, reason, "running cleanup");

        self.ai.disconnect(&record.correlation_id).await;
        self.egress.cleanup(&record.correlation_id);

        if let Some(snoop_channel) = &record.resources.snoop_channel_handle {
            let _ = self.pbx.hangup(snoop_channel).await;
        }
        if let Some(snoop_bridge) = &record.resources.snoop_bridge_handle {
            let _ = self.pbx.destroy_bridge(snoop_bridge).await;
        }
        let _ = self.pbx.hangup(&record.channel_id).await;
        if let Some(main_bridge) = &record.resources.main_bridge_handle {
            let _ = self.pbx.destroy_bridge(main_bridge).await;
        }
        if let Some(local_channel) = &record.resources.local_channel_handle {
            let _ = self.pbx.hangup(local_channel).await;
        }

        if let Some(conversation_id) = &record.conversation_id {
            let _ = self
                .transcript
                .complete(conversation_id, monotonic_millis())
                .await;
        }
    }
}

fn monotonic_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
