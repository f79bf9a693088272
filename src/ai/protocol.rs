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

//! Wire types for the realtime AI WebSocket protocol. Only the events this
//! bridge actually consumes or emits are modeled; unknown server events are
//! deserialized into [`ServerEvent::Other`] and logged, never rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionUpdatePayload },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
}

#[derive(Debug, Serialize)]
pub struct SessionUpdatePayload {
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub modalities: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "message")]
    Message {
        role: String,
        content: Vec<ConversationContent>,
    },
    #[serde(rename = "function_call_response")]
    FunctionCallResponse {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ConversationContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: Value },
    #[serde(rename = "session.updated")]
    SessionUpdated { session: Value },
    #[serde(rename = "session.expired")]
    SessionExpired,
    #[serde(rename = "response.content_part.added")]
    ResponseContentPartAdded { part: ContentPart },
    #[serde(rename = "conversation.item.created")]
    ConversationItemCreated { item: ServerConversationItem },
    #[serde(rename = "response.done")]
    ResponseDone,
    #[serde(rename = "error")]
    Error { error: ServerError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    pub audio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub status: Option<String>,
    pub role: Option<String>,
    pub content: Option<Vec<ServerContent>>,
    pub call_id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: Option<String>,
    pub audio: Option<AudioData>,
}

#[derive(Debug, Deserialize)]
pub struct AudioData {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: Option<String>,
    pub message: String,
}

impl ServerError {
    /// Authentication/authorization failures must not trigger a reconnect;
    /// everything else (rate limits, transient server errors) should.
    pub fn is_auth_failure(&self) -> bool {
        self.error_type == "invalid_request_error"
            && self
                .code
                .as_deref()
                .is_some_and(|c| c == "invalid_api_key" || c == "unauthorized")
    }
}
