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

use axum::{http::StatusCode, response::IntoResponse};
use miette::Diagnostic;
use std::io;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Error, Debug, Diagnostic)]
pub enum CodecError {
    #[error("PCM16 buffer has odd length {0}, cannot interpret as 16-bit samples")]
    InvalidPcmLength(usize),
    #[error("chunk is empty")]
    EmptyChunk,
    #[error("chunk length {len} out of range {min}..={max} for {format}")]
    ChunkLengthOutOfRange {
        len: usize,
        min: usize,
        max: usize,
        format: &'static str,
    },
}

#[derive(Error, Debug, Diagnostic)]
pub enum TrackerError {
    #[error("channel {0} is already admitted")]
    DuplicateChannel(String),
}

#[derive(Error, Debug, Diagnostic)]
pub enum PbxError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("REST command error: {0}")]
    Rest(#[from] reqwest::Error),
    #[error("control plane event was malformed: {0}")]
    MalformedEvent(String),
    #[error("control plane command {command} failed with status {status}: {body}")]
    CommandFailed {
        command: &'static str,
        status: u16,
        body: String,
    },
    #[error("control plane connection exhausted its reconnect budget")]
    ReconnectExhausted,
    #[error("required channel variable missing: {0}")]
    MissingChannelVariable(&'static str),
}

#[derive(Error, Debug, Diagnostic)]
pub enum IngressError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("unknown audio-socket UUID payload length {0}, expected 16 or 36")]
    MalformedUuid(usize),
    #[error("audio-socket connection presented unknown channel uuid {0}")]
    UnknownUuid(uuid::Uuid),
    #[error("frame payload length {0} exceeds maximum frame size {1}")]
    FrameTooLarge(usize, usize),
}

#[derive(Error, Debug, Diagnostic)]
pub enum EgressError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("RTP packet builder error: {0:?}")]
    RtpBuild(rtp_rs::RtpPacketBuildError),
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum AiError {
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connecting to the realtime session timed out")]
    ConnectTimeout,
    #[error("session authentication failed: {0}")]
    AuthFailure(String),
    #[error("server event could not be parsed: {0}")]
    MalformedEvent(#[from] serde_json::Error),
    #[error("reconnect budget of {0} attempts exhausted")]
    ReconnectExhausted(u32),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum TranscriptError {
    #[error("transcript sink request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Error, Debug, Diagnostic)]
pub enum TelemetryError {
    #[error("tracing subscriber was already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
    #[cfg(feature = "telemetry")]
    #[error("OTLP exporter could not be built: {0}")]
    ExporterBuild(#[from] opentelemetry_otlp::ExporterBuildError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum OrchestratorError {
    #[error("pbx error: {0}")]
    Pbx(#[from] Box<PbxError>),
    #[error("ai error: {0}")]
    Ai(#[from] Box<AiError>),
    #[error("tracker error: {0}")]
    Tracker(#[from] Box<TrackerError>),
    #[error("channel reply was dropped: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
}

#[derive(Error, Debug, Diagnostic)]
pub enum CallBridgeError {
    #[error("config error: {0}")]
    Config(#[from] Box<ConfigError>),
    #[error("codec error: {0}")]
    Codec(#[from] Box<CodecError>),
    #[error("tracker error: {0}")]
    Tracker(#[from] Box<TrackerError>),
    #[error("pbx error: {0}")]
    Pbx(#[from] Box<PbxError>),
    #[error("ingress error: {0}")]
    Ingress(#[from] Box<IngressError>),
    #[error("egress error: {0}")]
    Egress(#[from] Box<EgressError>),
    #[error("ai error: {0}")]
    Ai(#[from] Box<AiError>),
    #[error("transcript error: {0}")]
    Transcript(#[from] Box<TranscriptError>),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] Box<TelemetryError>),
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] Box<OrchestratorError>),
    #[error("I/O error: {0}")]
    IoError(#[from] Box<io::Error>),
    #[error("channel reply was dropped: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
pub type CodecResult<T> = Result<T, CodecError>;
pub type TrackerResult<T> = Result<T, TrackerError>;
pub type PbxResult<T> = Result<T, PbxError>;
pub type IngressResult<T> = Result<T, IngressError>;
pub type EgressResult<T> = Result<T, EgressError>;
pub type AiResult<T> = Result<T, AiError>;
pub type TranscriptResult<T> = Result<T, TranscriptError>;
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
pub type CallBridgeResult<T> = Result<T, CallBridgeError>;

pub trait ToBoxed {
    fn boxed(self) -> Box<Self>;
}

impl<T: std::error::Error> ToBoxed for T {
    fn boxed(self) -> Box<Self> {
        Box::new(self)
    }
}

pub trait ToBoxedResult<T, E: ToBoxed> {
    fn boxed(self) -> Result<T, Box<E>>;
}

impl<T, E: ToBoxed + std::error::Error> ToBoxedResult<T, E> for std::result::Result<T, E> {
    fn boxed(self) -> Result<T, Box<E>> {
        match self {
            Ok(it) => Ok(it),
            Err(err) => Err(err.boxed()),
        }
    }
}

impl IntoResponse for CallBridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            CallBridgeError::Tracker(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{self}")).into_response()
    }
}
