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

//! Process configuration: CLI/env overrides layered over a YAML file, with an
//! in-code default when no file is present.

use crate::error::ConfigResult;
use clap::Parser;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::fs;
use tracing::{info, instrument, warn};

#[derive(Parser)]
#[command(author, version, about, long_about)]
pub struct Args {
    /// Path to config file
    #[arg(short, long, env = "CALL_MEDIA_BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioSendFormat {
    Slin,
    Ulaw,
}

impl Default for AudioSendFormat {
    fn default() -> Self {
        AudioSendFormat::Ulaw
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub name: String,
    pub instance: InstanceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "call-media-bridge".to_owned(),
            instance: InstanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    pub name: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: gethostname().to_string_lossy().to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PbxConfig {
    pub base_url: String,
    pub websocket_url: String,
    pub username: String,
    pub password: String,
    pub application: String,
    /// Channel name prefix that identifies trunk-originated channels, e.g. "PJSIP/trunk-".
    pub trunk_channel_prefix: String,
    #[serde(default = "default_connect_backoff_base_ms", with = "serde_millis")]
    pub connect_backoff_base: Duration,
    #[serde(default = "default_connect_backoff_factor")]
    pub connect_backoff_factor: f64,
    #[serde(default = "default_connect_backoff_cap_ms", with = "serde_millis")]
    pub connect_backoff_cap: Duration,
    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
}

fn default_connect_backoff_base_ms() -> Duration {
    Duration::from_secs(3)
}
fn default_connect_backoff_factor() -> f64 {
    1.5
}
fn default_connect_backoff_cap_ms() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_max_attempts() -> u32 {
    10
}

impl Default for PbxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_owned(),
            websocket_url: "ws://127.0.0.1:8088/events".to_owned(),
            username: String::new(),
            password: String::new(),
            application: "call-media-bridge".to_owned(),
            trunk_channel_prefix: "PJSIP/trunk-".to_owned(),
            connect_backoff_base: default_connect_backoff_base_ms(),
            connect_backoff_factor: default_connect_backoff_factor(),
            connect_backoff_cap: default_connect_backoff_cap_ms(),
            connect_max_attempts: default_connect_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpListenerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    #[serde(default)]
    pub send_format: AudioSendFormat,
    /// Where to send synthesized audio back via RTP (C5) instead of ARI
    /// playback, for deployments where the PBX's external-media RTP target
    /// is fixed/known out of band. `None` keeps playback on the ARI path.
    #[serde(default)]
    pub egress_target: Option<std::net::SocketAddr>,
}

impl Default for RtpListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 40000,
            send_format: AudioSendFormat::default(),
            egress_target: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSocketConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for AudioSocketConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9099,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IngressStrategy {
    SnoopExternalMedia,
    AudioSocket,
}

impl Default for IngressStrategy {
    fn default() -> Self {
        IngressStrategy::SnoopExternalMedia
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    pub base_url: String,
    pub model: String,
    pub voice: String,
    pub api_key: String,
    pub initial_prompt: String,
    #[serde(default = "default_connect_deadline_ms", with = "serde_millis")]
    pub connect_deadline: Duration,
    #[serde(default = "default_idle_timeout_ms", with = "serde_millis")]
    pub idle_timeout: Duration,
    #[serde(default = "default_commit_debounce_ms", with = "serde_millis")]
    pub commit_debounce: Duration,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_cap_ms", with = "serde_millis")]
    pub reconnect_backoff_cap: Duration,
    #[serde(default = "default_pending_audio_capacity")]
    pub pending_audio_capacity: usize,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
    #[serde(default = "default_flush_batch_pause_ms", with = "serde_millis")]
    pub flush_batch_pause: Duration,
}

fn default_connect_deadline_ms() -> Duration {
    Duration::from_secs(10)
}
fn default_idle_timeout_ms() -> Duration {
    Duration::from_secs(300)
}
fn default_commit_debounce_ms() -> Duration {
    Duration::from_secs(1)
}
fn default_reconnect_max_attempts() -> u32 {
    5
}
fn default_reconnect_cap_ms() -> Duration {
    Duration::from_secs(30)
}
fn default_pending_audio_capacity() -> usize {
    100
}
fn default_flush_batch_size() -> usize {
    5
}
fn default_flush_batch_pause_ms() -> Duration {
    Duration::from_millis(50)
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            base_url: "wss://api.openai.com/v1/realtime".to_owned(),
            model: "gpt-4o-realtime-preview".to_owned(),
            voice: "alloy".to_owned(),
            api_key: String::new(),
            initial_prompt: String::new(),
            connect_deadline: default_connect_deadline_ms(),
            idle_timeout: default_idle_timeout_ms(),
            commit_debounce: default_commit_debounce_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_backoff_cap: default_reconnect_cap_ms(),
            pending_audio_capacity: default_pending_audio_capacity(),
            flush_batch_size: default_flush_batch_size(),
            flush_batch_pause: default_flush_batch_pause_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptConfig {
    /// Base URL of the external transcript sink. `None` disables transcript
    /// linkage entirely; the orchestrator continues without it.
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminConfig {
    pub bind_address: IpAddr,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 8088,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    pub grpc_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    #[serde(default)]
    pub endpoint: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "AppConfig::default")]
    pub app: AppConfig,
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
    pub pbx: PbxConfig,
    #[serde(default)]
    pub rtp_listener: RtpListenerConfig,
    #[serde(default)]
    pub audio_socket: AudioSocketConfig,
    #[serde(default)]
    pub ingress_strategy: IngressStrategy,
    pub ai: AiConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub transcript: TranscriptConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: Default::default(),
            telemetry: Default::default(),
            pbx: Default::default(),
            rtp_listener: Default::default(),
            audio_socket: Default::default(),
            ingress_strategy: Default::default(),
            ai: Default::default(),
            admin: Default::default(),
            transcript: Default::default(),
        }
    }
}

impl Config {
    #[instrument]
    pub async fn load() -> ConfigResult<Config> {
        let args = Args::parse();

        info!("Loading config …");

        Config::load_from_file(args.config.as_deref()).await
    }

    #[instrument]
    async fn load_from_file(path: Option<&Path>) -> ConfigResult<Config> {
        match path {
            Some(path) => {
                let content = fs::read_to_string(path).await?;
                let config = serde_yaml::from_str(&content)?;
                info!("Config loaded from {}", path.to_string_lossy());
                Ok(config)
            }
            None => {
                let path = if cfg!(debug_assertions) {
                    let it = "./config-dev.yaml";
                    warn!("No config file specified, using {it}");
                    it
                } else {
                    let it = "/etc/call-media-bridge/config.yaml";
                    warn!("No config file specified, using {it}");
                    it
                };
                match fs::read_to_string(path).await {
                    Ok(content) => {
                        let config = serde_yaml::from_str(&content)?;
                        info!("Config loaded from {path}");
                        Ok(config)
                    }
                    Err(_) => {
                        warn!("Could not read config file {path}, using default config.");
                        Ok(Config::default())
                    }
                }
            }
        }
    }

    pub fn instance_name(&self) -> String {
        format!("{}/{}", self.app.name, self.app.instance.name)
    }
}
