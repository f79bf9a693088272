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

//! REST commands against the control plane. Every command tolerates a 404
//! ("already gone") by treating it as success, per the failure semantics in
//! the control client's contract with the orchestrator.

use crate::{config::PbxConfig, error::PbxError};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

type Result<T> = std::result::Result<T, PbxError>;

async fn check_status(command: &'static str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(PbxError::CommandFailed {
            command,
            status: status.as_u16(),
            body,
        })
    }
}

pub async fn answer(http: &Client, config: &PbxConfig, channel_id: &str) -> Result<()> {
    let url = format!(
        "{}/ari/channels/{channel_id}/answer",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .send()
        .await?;
    check_status("answer", resp).await?;
    Ok(())
}

pub async fn hangup(http: &Client, config: &PbxConfig, channel_id: &str) -> Result<()> {
    let url = format!(
        "{}/ari/channels/{channel_id}",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .delete(url)
        .basic_auth(&config.username, Some(&config.password))
        .send()
        .await?;
    check_status("hangup", resp).await?;
    Ok(())
}

pub async fn get_channel_var(
    http: &Client,
    config: &PbxConfig,
    channel_id: &str,
    variable: &str,
) -> Result<Option<String>> {
    #[derive(Deserialize)]
    struct VarResponse {
        value: String,
    }

    let url = format!(
        "{}/ari/channels/{channel_id}/variable",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .get(url)
        .query(&[("variable", variable)])
        .basic_auth(&config.username, Some(&config.password))
        .send()
        .await?;
    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let resp = check_status("channel.getVar", resp).await?;
    let parsed: VarResponse = resp.json().await?;
    Ok(Some(parsed.value))
}

pub async fn create_mixing_bridge(http: &Client, config: &PbxConfig, name: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct BridgeResponse {
        id: String,
    }

    let url = format!("{}/ari/bridges", config.base_url.trim_end_matches('/'));
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("type", "mixing"), ("name", name)])
        .send()
        .await?;
    let resp = check_status("bridges.create", resp).await?;
    let parsed: BridgeResponse = resp.json().await?;
    Ok(parsed.id)
}

pub async fn add_channel_to_bridge(
    http: &Client,
    config: &PbxConfig,
    bridge_id: &str,
    channel_id: &str,
) -> Result<()> {
    let url = format!(
        "{}/ari/bridges/{bridge_id}/addChannel",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("channel", channel_id)])
        .send()
        .await?;
    check_status("bridge.add", resp).await?;
    Ok(())
}

pub async fn record_bridge(
    http: &Client,
    config: &PbxConfig,
    bridge_id: &str,
    recording_name: &str,
) -> Result<()> {
    let url = format!(
        "{}/ari/bridges/{bridge_id}/record",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[
            ("name", recording_name),
            ("format", "wav"),
            ("maxDurationSeconds", "3600"),
            ("beep", "false"),
            ("ifExists", "overwrite"),
        ])
        .send()
        .await?;
    check_status("bridge.record", resp).await?;
    Ok(())
}

pub async fn destroy_bridge(http: &Client, config: &PbxConfig, bridge_id: &str) -> Result<()> {
    let url = format!(
        "{}/ari/bridges/{bridge_id}",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .delete(url)
        .basic_auth(&config.username, Some(&config.password))
        .send()
        .await?;
    check_status("bridge.destroy", resp).await?;
    Ok(())
}

pub async fn snoop_channel(
    http: &Client,
    config: &PbxConfig,
    channel_id: &str,
    app: &str,
) -> Result<String> {
    #[derive(Deserialize)]
    struct SnoopResponse {
        id: String,
    }

    let url = format!(
        "{}/ari/channels/{channel_id}/snoop",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("spy", "in"), ("app", app)])
        .send()
        .await?;
    let resp = check_status("channel.snoop", resp).await?;
    let parsed: SnoopResponse = resp.json().await?;
    Ok(parsed.id)
}

pub async fn external_media(
    http: &Client,
    config: &PbxConfig,
    channel_id: &str,
    host: &str,
    port: u16,
    format: &str,
    app: &str,
) -> Result<()> {
    let url = format!(
        "{}/ari/channels/{channel_id}/externalMedia",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[
            ("app", app),
            ("external_host", &format!("{host}:{port}")),
            ("format", format),
            ("direction", "read"),
        ])
        .send()
        .await?;
    check_status("channel.externalMedia", resp).await?;
    Ok(())
}

pub async fn play_media(
    http: &Client,
    config: &PbxConfig,
    channel_id: &str,
    media_ref: &str,
) -> Result<String> {
    #[derive(Deserialize)]
    struct PlaybackResponse {
        id: String,
    }

    let url = format!(
        "{}/ari/channels/{channel_id}/play",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("media", media_ref)])
        .send()
        .await?;
    let resp = check_status("channel.play", resp).await?;
    let parsed: PlaybackResponse = resp.json().await?;
    Ok(parsed.id)
}

pub async fn upload_sound(
    http: &Client,
    config: &PbxConfig,
    sound_id: &str,
    format: &str,
    bytes: Vec<u8>,
) -> Result<()> {
    let url = format!(
        "{}/ari/sounds/{sound_id}",
        config.base_url.trim_end_matches('/')
    );
    let resp = http
        .put(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("format", format)])
        .body(bytes)
        .send()
        .await?;
    check_status("sounds.upload", resp).await?;
    Ok(())
}

pub async fn subscribe_application(
    http: &Client,
    config: &PbxConfig,
    event_source: &str,
) -> Result<()> {
    let url = format!(
        "{}/ari/applications/{}/subscription",
        config.base_url.trim_end_matches('/'),
        config.application
    );
    let resp = http
        .post(url)
        .basic_auth(&config.username, Some(&config.password))
        .query(&[("eventSource", event_source)])
        .send()
        .await?;
    check_status("applications.subscribe", resp).await?;
    Ok(())
}
