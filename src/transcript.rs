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

//! Transcript sink: a small external collaborator the orchestrator writes
//! conversation turns to. Kept as a plain `reqwest`-backed client rather
//! than a trait object — there is exactly one kind of sink in this
//! deployment, configured by URL.

use crate::error::TranscriptResult;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct TranscriptSink {
    http: Client,
    base_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct AppendMessageRequest<'a> {
    role: &'a str,
    content: &'a str,
}

impl TranscriptSink {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    /// Best-effort: the orchestrator continues without transcript linkage on
    /// failure, so this never propagates an error past a log line.
    #[instrument(skip(self))]
    pub async fn find_or_create_conversation(
        &self,
        call_id: &str,
        patient_id: Option<&str>,
        start_time: u64,
    ) -> Option<String> {
        let base_url = self.base_url.as_ref()?;
        let url = format!("{}/conversations", base_url.trim_end_matches('/'));
        let body = json!({
            "callId": call_id,
            "patientId": patient_id,
            "startTime": start_time,
        });

        match self.http.post(url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<ConversationId>().await {
                Ok(parsed) => Some(parsed.id),
                Err(e) => {
                    warn!(call_id, error = %e, "transcript conversation response malformed");
                    None
                }
            },
            Ok(resp) => {
                warn!(call_id, status = %resp.status(), "transcript conversation create failed");
                None
            }
            Err(e) => {
                warn!(call_id, error = %e, "transcript sink unreachable");
                None
            }
        }
    }

    #[instrument(skip(self, content))]
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
    ) -> TranscriptResult<()> {
        let Some(base_url) = &self.base_url else {
            return Ok(());
        };
        let url = format!(
            "{}/conversations/{conversation_id}/messages",
            base_url.trim_end_matches('/')
        );
        self.http
            .post(url)
            .json(&AppendMessageRequest { role, content })
            .send()
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn complete(&self, conversation_id: &str, end_time: u64) -> TranscriptResult<()> {
        let Some(base_url) = &self.base_url else {
            return Ok(());
        };
        let url = format!(
            "{}/conversations/{conversation_id}/complete",
            base_url.trim_end_matches('/')
        );
        self.http
            .post(url)
            .json(&json!({ "status": "completed", "endTime": end_time }))
            .send()
            .await?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct ConversationId {
    id: String,
}
