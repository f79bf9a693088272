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

//! Realtime AI client: one cooperative connection per call, keyed by
//! correlation id. Each connection is its own subsystem task; the registry
//! only holds the command channel used to reach it.

pub mod protocol;

use crate::{
    ai::protocol::{
        ClientEvent, ConversationContent, ConversationItem, ServerEvent, SessionUpdatePayload,
    },
    codec::{encode_pcm16_to_mulaw, pcm16_bytes_to_samples, resample_linear},
    config::AiConfig,
    reconnect::{Backoff, BackoffPolicy, ReconnectManager},
    tracker::ChannelTracker,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::header::{AUTHORIZATION, HeaderValue},
    },
};
use tracing::{debug, info, instrument, warn};

const OPENAI_SAMPLE_RATE: u32 = 24000;
const TELEPHONY_SAMPLE_RATE: u32 = 8000;
const PRIMING_MESSAGE: &str = "Hello, are you there?";

#[derive(Debug)]
pub enum AiNotification {
    SessionReady {
        channel_id: String,
    },
    AudioChunk {
        channel_id: String,
        mulaw_base64: String,
    },
    TextMessage {
        channel_id: String,
        conversation_id: Option<String>,
        role: String,
        content: String,
    },
    FunctionCall {
        channel_id: String,
        call_id: String,
        name: String,
        arguments: String,
    },
    MaxReconnectFailed {
        channel_id: String,
    },
    Closed {
        channel_id: String,
    },
}

enum AiCommand {
    SendAudio(String),
    SendText {
        content: String,
        role: String,
        function_call_id: Option<String>,
    },
    BindConversation(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionStatus {
    Initializing,
    Connecting,
    Connected,
    SessionReady,
    Reconnecting,
    Closed,
    Error,
}

/// Per-call connection registry. Construct once, share behind `Arc`.
#[derive(Default)]
pub struct AiRegistry {
    calls: DashMap<String, mpsc::Sender<AiCommand>>,
}

impl AiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, config, notify, tracker, reconnect))]
    pub fn initialize(
        self: &Arc<Self>,
        config: AiConfig,
        channel_id: String,
        correlation_id: String,
        initial_prompt: String,
        notify: mpsc::Sender<AiNotification>,
        tracker: Arc<ChannelTracker>,
        reconnect: Arc<ReconnectManager>,
    ) {
        let (command_tx, command_rx) = mpsc::channel(256);
        self.calls.insert(correlation_id.clone(), command_tx);

        let registry = self.clone();
        tokio::spawn(async move {
            AiConnection {
                channel_id,
                correlation_id: correlation_id.clone(),
                config,
                initial_prompt,
                command_rx,
                notify,
                tracker,
                reconnect,
                status: ConnectionStatus::Initializing,
                pending_audio: VecDeque::new(),
                conversation_id: None,
                total_audio_bytes_sent: 0,
                valid_audio_chunks_sent: 0,
                commit_deadline: None,
            }
            .run()
            .await;
            registry.calls.remove(&correlation_id);
        });
    }

    pub async fn send_audio(&self, correlation_id: &str, mulaw_base64: &str) {
        if let Some(tx) = self.calls.get(correlation_id) {
            let _ = tx.send(AiCommand::SendAudio(mulaw_base64.to_owned())).await;
        }
    }

    pub async fn send_text(
        &self,
        correlation_id: &str,
        content: String,
        role: String,
        function_call_id: Option<String>,
    ) {
        if let Some(tx) = self.calls.get(correlation_id) {
            let _ = tx
                .send(AiCommand::SendText {
                    content,
                    role,
                    function_call_id,
                })
                .await;
        }
    }

    pub async fn bind_conversation(&self, correlation_id: &str, conversation_id: String) {
        if let Some(tx) = self.calls.get(correlation_id) {
            let _ = tx.send(AiCommand::BindConversation(conversation_id)).await;
        }
    }

    #[instrument(skip(self))]
    pub async fn disconnect(&self, correlation_id: &str) {
        if let Some((_, tx)) = self.calls.remove(correlation_id) {
            let _ = tx.send(AiCommand::Disconnect).await;
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct AiConnection {
    channel_id: String,
    correlation_id: String,
    config: AiConfig,
    initial_prompt: String,
    command_rx: mpsc::Receiver<AiCommand>,
    notify: mpsc::Sender<AiNotification>,
    tracker: Arc<ChannelTracker>,
    reconnect: Arc<ReconnectManager>,
    status: ConnectionStatus,
    pending_audio: VecDeque<String>,
    conversation_id: Option<String>,
    total_audio_bytes_sent: u64,
    valid_audio_chunks_sent: u64,
    commit_deadline: Option<Instant>,
}

impl AiConnection {
    async fn run(mut self) {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: self.config.reconnect_max_attempts,
        });

        loop {
            self.status = ConnectionStatus::Connecting;
            match self.connect().await {
                Ok(mut ws) => {
                    backoff.reset();
                    match self.session_loop(&mut ws).await {
                        SessionOutcome::NormalClose => break,
                        SessionOutcome::Disconnected => break,
                        SessionOutcome::AuthFailure => {
                            warn!(correlation_id = %self.correlation_id, "ai session auth failure, not reconnecting");
                            break;
                        }
                        SessionOutcome::Reconnect => {}
                    }
                }
                Err(err) => {
                    warn!(correlation_id = %self.correlation_id, error = %err, "ai connect failed");
                }
            }

            self.status = ConnectionStatus::Reconnecting;
            match backoff.next_delay() {
                Some(delay) => {
                    let attempt = backoff.attempts();
                    if let Some(rx) = self.reconnect.schedule(self.correlation_id.clone(), delay, attempt) {
                        let _ = rx.await;
                    }
                }
                None => {
                    let _ = self
                        .notify
                        .send(AiNotification::MaxReconnectFailed {
                            channel_id: self.channel_id.clone(),
                        })
                        .await;
                    break;
                }
            }
        }

        self.status = ConnectionStatus::Closed;
        let _ = self
            .notify
            .send(AiNotification::Closed {
                channel_id: self.channel_id.clone(),
            })
            .await;
    }

    #[instrument(skip(self), err)]
    async fn connect(&mut self) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
        let url = format!(
            "{}/v1/realtime?model={}&voice={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            self.config.voice
        );

        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .unwrap_or_else(|_| HeaderValue::from_static("")),
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let connect = connect_async(request);
        match tokio::time::timeout(self.config.connect_deadline, connect).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(tokio_tungstenite::tungstenite::Error::Io(
                std::io::Error::new(std::io::ErrorKind::TimedOut, "ai connect deadline exceeded"),
            )),
        }
    }

    async fn session_loop(&mut self, ws: &mut WsStream) -> SessionOutcome {
        self.status = ConnectionStatus::Connected;

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(AiCommand::SendAudio(b64)) => self.handle_send_audio(ws, b64).await,
                        Some(AiCommand::SendText { content, role, function_call_id }) => {
                            self.handle_send_text(ws, content, role, function_call_id).await;
                        }
                        Some(AiCommand::BindConversation(id)) => self.conversation_id = Some(id),
                        Some(AiCommand::Disconnect) | None => {
                            let _ = ws.close(None).await;
                            return SessionOutcome::Disconnected;
                        }
                    }
                }
                message = ws.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(outcome) = self.handle_server_message(ws, &text).await {
                                return outcome;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                            return if code == 1000 {
                                SessionOutcome::NormalClose
                            } else {
                                SessionOutcome::Reconnect
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(correlation_id = %self.correlation_id, error = %e, "ai websocket error");
                            return SessionOutcome::Reconnect;
                        }
                        None => return SessionOutcome::Reconnect,
                    }
                }
                _ = until_commit_deadline(self.commit_deadline) => {
                    self.commit_deadline = None;
                    self.maybe_fire_commit(ws).await;
                }
                _ = tokio::time::sleep(self.config.idle_timeout) => {
                    info!(correlation_id = %self.correlation_id, "ai connection idle timeout");
                    let _ = ws.close(None).await;
                    return SessionOutcome::Disconnected;
                }
            }
        }
    }

    async fn handle_send_audio(&mut self, ws: &mut WsStream, mulaw_base64: String) {
        if self.status != ConnectionStatus::SessionReady {
            enqueue_pending(
                &mut self.pending_audio,
                self.config.pending_audio_capacity,
                mulaw_base64,
            );
            return;
        }

        self.append_audio(ws, &mulaw_base64).await;
        self.commit_deadline = Some(Instant::now() + self.config.commit_debounce);
        self.tracker.update(&self.channel_id, |r| r.touch()).await;
    }

    async fn append_audio(&mut self, ws: &mut WsStream, mulaw_base64: &str) {
        let event = ClientEvent::InputAudioBufferAppend {
            audio: mulaw_base64.to_owned(),
        };
        if send_event(ws, &event).await.is_ok() {
            self.total_audio_bytes_sent += BASE64.decode(mulaw_base64).map(|b| b.len()).unwrap_or(0) as u64;
            self.valid_audio_chunks_sent += 1;
        }
    }

    async fn maybe_fire_commit(&mut self, ws: &mut WsStream) {
        if !commit_is_due(self.valid_audio_chunks_sent, self.total_audio_bytes_sent) {
            return;
        }
        let _ = send_event(ws, &ClientEvent::InputAudioBufferCommit).await;
    }

    async fn handle_send_text(
        &mut self,
        ws: &mut WsStream,
        content: String,
        role: String,
        function_call_id: Option<String>,
    ) {
        let item = match function_call_id {
            Some(call_id) => ConversationItem::FunctionCallResponse {
                call_id,
                output: content,
            },
            None => ConversationItem::Message {
                role,
                content: vec![ConversationContent {
                    content_type: "input_text".to_owned(),
                    text: content,
                }],
            },
        };
        let _ = send_event(ws, &ClientEvent::ConversationItemCreate { item }).await;
    }

    /// Returns `Some(outcome)` when the session should end, `None` to keep looping.
    async fn handle_server_message(
        &mut self,
        ws: &mut WsStream,
        text: &str,
    ) -> Option<SessionOutcome> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => {
                warn!(correlation_id = %self.correlation_id, error = %e, "malformed server event");
                return None;
            }
        };

        match event {
            ServerEvent::SessionCreated { .. } => {
                self.complete_handshake(ws).await;
            }
            ServerEvent::SessionUpdated { .. } => {
                debug!(correlation_id = %self.correlation_id, "session updated");
            }
            ServerEvent::SessionExpired => {
                return Some(SessionOutcome::Reconnect);
            }
            ServerEvent::ResponseContentPartAdded { part } => {
                if part.content_type == "audio" {
                    if let Some(audio) = part.audio {
                        self.forward_ai_audio(audio).await;
                    }
                }
            }
            ServerEvent::ConversationItemCreated { item } => {
                self.handle_conversation_item(item).await;
            }
            ServerEvent::ResponseDone => {}
            ServerEvent::Error { error } => {
                warn!(correlation_id = %self.correlation_id, message = %error.message, "ai server error");
                if error.is_auth_failure() {
                    return Some(SessionOutcome::AuthFailure);
                }
            }
            ServerEvent::Other => {}
        }
        None
    }

    async fn forward_ai_audio(&mut self, pcm16_base64: String) {
        let Ok(pcm_bytes) = BASE64.decode(&pcm16_base64) else {
            return;
        };
        let Ok(samples) = pcm16_bytes_to_samples(&pcm_bytes) else {
            return;
        };
        let resampled = resample_linear(&samples, OPENAI_SAMPLE_RATE, TELEPHONY_SAMPLE_RATE);
        let mulaw = encode_pcm16_to_mulaw(&resampled);
        let mulaw_base64 = BASE64.encode(mulaw);
        self.tracker.update(&self.channel_id, |r| r.touch()).await;
        let _ = self
            .notify
            .send(AiNotification::AudioChunk {
                channel_id: self.channel_id.clone(),
                mulaw_base64,
            })
            .await;
    }

    async fn handle_conversation_item(&mut self, item: protocol::ServerConversationItem) {
        if item.item_type == "function_call" {
            let _ = self
                .notify
                .send(AiNotification::FunctionCall {
                    channel_id: self.channel_id.clone(),
                    call_id: item.call_id.unwrap_or_default(),
                    name: item.name.unwrap_or_default(),
                    arguments: item.arguments.unwrap_or_default(),
                })
                .await;
            return;
        }

        if item.item_type == "message" && item.status.as_deref() == Some("completed") {
            let content = item.content.unwrap_or_default();

            for audio in content.iter().filter_map(|c| c.audio.as_ref()) {
                self.forward_ai_audio(audio.data.clone()).await;
            }

            let role = item.role.unwrap_or_else(|| "assistant".to_owned());
            let text: String = content
                .into_iter()
                .filter_map(|c| c.text)
                .collect::<Vec<_>>()
                .join(" ");

            let _ = self
                .notify
                .send(AiNotification::TextMessage {
                    channel_id: self.channel_id.clone(),
                    conversation_id: self.conversation_id.clone(),
                    role,
                    content: text,
                })
                .await;
        }
    }

    /// Flushes up to [`AiConfig::pending_audio_capacity`] queued chunks in
    /// batches, pausing between batches to respect rate limits.
    async fn flush_pending(&mut self, ws: &mut WsStream) {
        let queued: Vec<String> = self.pending_audio.drain(..).collect();
        if queued.is_empty() {
            return;
        }
        for batch in queued.chunks(self.config.flush_batch_size) {
            for chunk in batch {
                self.append_audio(ws, chunk).await;
            }
            tokio::time::sleep(self.config.flush_batch_pause).await;
        }
        self.commit_deadline = Some(Instant::now() + self.config.commit_debounce);
        self.tracker.update(&self.channel_id, |r| r.touch()).await;
    }

    async fn complete_handshake(&mut self, ws: &mut WsStream) {
        let session = SessionUpdatePayload {
            instructions: self.initial_prompt.clone(),
            voice: self.config.voice.clone(),
            input_audio_format: "g711_ulaw".to_owned(),
            output_audio_format: "pcm16".to_owned(),
            modalities: vec!["text".to_owned(), "audio".to_owned()],
        };
        let _ = send_event(ws, &ClientEvent::SessionUpdate { session }).await;
        let _ = send_event(
            ws,
            &ClientEvent::ConversationItemCreate {
                item: ConversationItem::Message {
                    role: "user".to_owned(),
                    content: vec![ConversationContent {
                        content_type: "input_text".to_owned(),
                        text: PRIMING_MESSAGE.to_owned(),
                    }],
                },
            },
        )
        .await;

        self.status = ConnectionStatus::SessionReady;
        let _ = self
            .notify
            .send(AiNotification::SessionReady {
                channel_id: self.channel_id.clone(),
            })
            .await;
        self.flush_pending(ws).await;
    }
}

/// FIFO bounded enqueue: drops the oldest entry once `capacity` is reached,
/// so the newest audio always wins a full buffer.
fn enqueue_pending(queue: &mut VecDeque<String>, capacity: usize, chunk: String) {
    if queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(chunk);
}

/// A commit is only worth sending once at least one valid chunk has been
/// appended and the cumulative µ-law duration, plus a 50 ms safety margin,
/// reaches 100 ms (`total_audio_bytes_sent / 8` ms for 8 kHz µ-law).
fn commit_is_due(valid_audio_chunks_sent: u64, total_audio_bytes_sent: u64) -> bool {
    if valid_audio_chunks_sent == 0 {
        return false;
    }
    let sent_duration_ms = total_audio_bytes_sent / 8;
    sent_duration_ms + 50 >= 100
}

enum SessionOutcome {
    NormalClose,
    Disconnected,
    Reconnect,
    AuthFailure,
}

async fn until_commit_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

async fn send_event(
    ws: &mut WsStream,
    event: &ClientEvent,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    let json = serde_json::to_string(event).unwrap_or_default();
    ws.send(Message::Text(json.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_queue_drops_oldest_once_full() {
        let mut queue = VecDeque::new();
        for i in 0..150 {
            enqueue_pending(&mut queue, 100, format!("chunk-{i}"));
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.front().unwrap(), "chunk-50");
        assert_eq!(queue.back().unwrap(), "chunk-149");
    }

    #[test]
    fn commit_is_not_due_without_any_valid_chunks() {
        assert!(!commit_is_due(0, 10_000));
    }

    #[test]
    fn commit_is_not_due_below_the_100ms_plus_margin_threshold() {
        // 160 bytes of 8kHz mulaw = 20ms; well short of the 50ms threshold.
        assert!(!commit_is_due(1, 160));
    }

    #[test]
    fn commit_is_due_once_cumulative_duration_plus_margin_reaches_100ms() {
        // 400 bytes / 8 = 50ms sent, + 50ms margin = 100ms, meets the bar.
        assert!(commit_is_due(3, 400));
        assert!(commit_is_due(3, 800));
    }

    #[test]
    fn flush_pending_batches_respect_batch_size() {
        let queued: Vec<String> = (0..12).map(|i| format!("c{i}")).collect();
        let batches: Vec<_> = queued.chunks(5).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 5);
        assert_eq!(batches[2].len(), 2);
    }

    /// Scenario: 150 chunks arrive before `sessionReady`. Exactly the newest
    /// 100 survive the bounded queue, and flushing them preserves their
    /// original arrival order across 5-chunk batches.
    #[test]
    fn buffer_overflow_then_flush_preserves_fifo_order_across_batches() {
        let mut queue = VecDeque::new();
        for i in 0..150 {
            enqueue_pending(&mut queue, 100, format!("chunk-{i}"));
        }
        assert_eq!(queue.len(), 100);

        let flushed: Vec<String> = queue.into_iter().collect();
        let expected: Vec<String> = (50..150).map(|i| format!("chunk-{i}")).collect();
        assert_eq!(flushed, expected);

        let batches: Vec<&[String]> = flushed.chunks(5).collect();
        assert_eq!(batches.len(), 20);
        assert_eq!(batches[0], expected[0..5]);
        assert_eq!(batches[19], expected[95..100]);
        for batch in &batches {
            assert_eq!(batch.len(), 5);
        }
    }
}
