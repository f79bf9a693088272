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

//! RTP sender: one UDP socket and one sequence/timestamp/SSRC state per call,
//! keyed by correlation id. No receiver lives here; inbound RTP is somebody
//! else's problem once the SSRC has been registered with the tracker.

use crate::{
    codec::{decode_mulaw_to_pcm16, samples_to_pcm16_bytes},
    config::AudioSendFormat,
    error::{EgressError, EgressResult},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use dashmap::DashMap;
use rand::Rng;
use rtp_rs::{RtpPacketBuilder, Seq};
use std::{net::SocketAddr, sync::atomic::{AtomicU16, AtomicU32, Ordering}};
use tokio::net::UdpSocket;
use tracing::{instrument, warn};

const SAMPLES_PER_FRAME: usize = 160;
const PAYLOAD_TYPE_PCMU: u8 = 0;
const PAYLOAD_TYPE_L16: u8 = 11;

struct EgressState {
    socket: UdpSocket,
    target: SocketAddr,
    format: AudioSendFormat,
    ssrc: u32,
    sequence: AtomicU16,
    timestamp: AtomicU32,
}

/// Per-call RTP senders, keyed by correlation id.
#[derive(Default)]
pub struct RtpEgress {
    calls: DashMap<String, EgressState>,
}

impl RtpEgress {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self))]
    pub async fn initialize(
        &self,
        correlation_id: &str,
        target: SocketAddr,
        format: AudioSendFormat,
    ) -> EgressResult<()> {
        let bind_addr: SocketAddr = "0.0.0.0:0".parse().expect("valid bind address");
        let socket = UdpSocket::bind(bind_addr).await?;

        let mut rng = rand::rng();
        let state = EgressState {
            socket,
            target,
            format,
            ssrc: rng.random::<u32>(),
            sequence: AtomicU16::new(rng.random::<u16>()),
            timestamp: AtomicU32::new(rng.random::<u32>()),
        };
        self.calls.insert(correlation_id.to_owned(), state);
        Ok(())
    }

    /// Decodes µ-law base64 audio, transcodes if needed, splits into 20 ms
    /// frames and sends each as its own RTP packet.
    #[instrument(skip(self, mulaw_base64))]
    pub async fn send_audio(&self, correlation_id: &str, mulaw_base64: &str) -> EgressResult<()> {
        let Some(state) = self.calls.get(correlation_id) else {
            warn!(correlation_id, "send_audio called for unknown call, dropping");
            return Ok(());
        };

        let mulaw_bytes = BASE64.decode(mulaw_base64)?;

        match state.format {
            AudioSendFormat::Ulaw => {
                for frame in mulaw_bytes.chunks(SAMPLES_PER_FRAME) {
                    self.send_frame(&state, frame, PAYLOAD_TYPE_PCMU).await?;
                }
            }
            AudioSendFormat::Slin => {
                let samples = decode_mulaw_to_pcm16(&mulaw_bytes);
                let pcm_bytes = samples_to_pcm16_bytes(&samples);
                for frame in pcm_bytes.chunks(SAMPLES_PER_FRAME * 2) {
                    self.send_frame(&state, frame, PAYLOAD_TYPE_L16).await?;
                }
            }
        }

        Ok(())
    }

    async fn send_frame(
        &self,
        state: &EgressState,
        payload: &[u8],
        payload_type: u8,
    ) -> EgressResult<()> {
        let sequence = state.sequence.fetch_add(1, Ordering::Relaxed);
        let timestamp = state
            .timestamp
            .fetch_add(SAMPLES_PER_FRAME as u32, Ordering::Relaxed);

        let mut packet = [0u8; 12 + 320];
        let built = RtpPacketBuilder::new()
            .payload_type(payload_type)
            .ssrc(state.ssrc)
            .sequence(Seq::from(sequence))
            .timestamp(timestamp)
            .payload(payload)
            .build_into(&mut packet)
            .map_err(EgressError::RtpBuild)?;

        state.socket.send_to(&packet[..built], state.target).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn cleanup(&self, correlation_id: &str) {
        self.calls.remove(correlation_id);
    }
}
