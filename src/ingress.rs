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

//! AudioSocket TCP ingress: a single listener, one state machine per
//! accepted connection. This is the alternate ingress strategy to
//! snoop+external-media RTP — dialplans that dial out to a TCP endpoint
//! land here instead.

use crate::{
    ai::AiRegistry,
    codec::{ChunkFormat, validate_chunk},
    error::IngressResult,
    tracker::ChannelTracker,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const FRAME_TYPE_TERMINATE: u8 = 0x00;
const FRAME_TYPE_UUID: u8 = 0x01;
const FRAME_TYPE_DTMF: u8 = 0x03;
const FRAME_TYPE_AUDIO: u8 = 0x10;
const FRAME_TYPE_ERROR: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    AwaitingUuid,
    Streaming,
    Closed,
    Error,
}

#[instrument(skip(subsys, tracker, ai))]
pub async fn start_audio_socket_listener(
    subsys: &SubsystemHandle,
    bind_address: SocketAddr,
    tracker: Arc<ChannelTracker>,
    ai: Arc<AiRegistry>,
) -> IngressResult<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(%bind_address, "audio-socket listener bound");

    subsys.start(SubsystemBuilder::new("audio-socket-listener", move |s| {
        accept_loop(s, listener, tracker, ai)
    }));

    Ok(())
}

async fn accept_loop(
    subsys: SubsystemHandle,
    listener: TcpListener,
    tracker: Arc<ChannelTracker>,
    ai: Arc<AiRegistry>,
) -> IngressResult<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let tracker = tracker.clone();
                let sink = ai.clone();
                subsys.start(SubsystemBuilder::new(format!("audio-socket-{peer}"), move |s| {
                    handle_connection(s, stream, peer, tracker, sink)
                }));
            }
            _ = subsys.on_shutdown_requested() => break,
        }
    }
    Ok(())
}

async fn handle_connection(
    subsys: SubsystemHandle,
    mut stream: TcpStream,
    peer: SocketAddr,
    tracker: Arc<ChannelTracker>,
    ai: Arc<AiRegistry>,
) -> IngressResult<()> {
    let mut state = ConnectionState::AwaitingUuid;
    let mut channel_id = String::new();
    let mut correlation_id = String::new();
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut read_buf = [0u8; 4096];

    loop {
        if state == ConnectionState::Closed || state == ConnectionState::Error {
            break;
        }

        let n = tokio::select! {
            read = stream.read(&mut read_buf) => match read {
                Ok(0) => {
                    state = ConnectionState::Closed;
                    continue;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, error = %e, "audio-socket read error");
                    state = ConnectionState::Error;
                    continue;
                }
            },
            _ = subsys.on_shutdown_requested() => break,
        };

        buf.extend_from_slice(&read_buf[..n]);

        while let Some((frame_type, payload)) = take_frame(&mut buf) {
            match (state, frame_type) {
                (ConnectionState::AwaitingUuid, FRAME_TYPE_UUID) => {
                    match parse_uuid_payload(&payload) {
                        Some(uuid) => match tracker.find_by_uuid(&uuid) {
                            Some(found_channel_id) => {
                                let record = tracker.get(&found_channel_id);
                                correlation_id = match record {
                                    Some(r) => r.lock().await.correlation_id.clone(),
                                    None => found_channel_id.clone(),
                                };
                                channel_id = found_channel_id;
                                state = ConnectionState::Streaming;
                            }
                            None => {
                                warn!(%uuid, "audio-socket uuid has no known channel, closing");
                                state = ConnectionState::Closed;
                            }
                        },
                        None => {
                            warn!(len = payload.len(), "malformed audio-socket uuid payload");
                            state = ConnectionState::Error;
                        }
                    }
                }
                (ConnectionState::Streaming, FRAME_TYPE_AUDIO) => {
                    let validation = validate_chunk(&payload, ChunkFormat::MuLaw8k);
                    if !validation.ok {
                        warn!(
                            %correlation_id,
                            reason = validation.reason.as_deref().unwrap_or("unknown"),
                            "dropping invalid audio-socket chunk"
                        );
                    } else {
                        let b64 = BASE64.encode(&payload);
                        ai.send_audio(&correlation_id, &b64).await;
                        tracker.update(&channel_id, |r| r.touch()).await;
                    }
                }
                (ConnectionState::Streaming, FRAME_TYPE_DTMF) => {
                    info!(%correlation_id, "dtmf frame received on audio-socket ingress");
                }
                (_, FRAME_TYPE_TERMINATE) => {
                    state = ConnectionState::Closed;
                }
                (_, FRAME_TYPE_ERROR) => {
                    state = ConnectionState::Error;
                }
                _ => {
                    // unknown or out-of-state frame type, ignore
                }
            }
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

/// Pulls one complete `type(1) || length(2 BE) || payload(length)` frame off
/// the front of `buf`, if one is fully buffered, tolerating arbitrary chunk
/// boundaries: a partial header or a partial payload simply leaves `buf`
/// untouched until a later read completes it.
fn take_frame(buf: &mut Vec<u8>) -> Option<(u8, Vec<u8>)> {
    if buf.len() < 3 {
        return None;
    }
    let frame_type = buf[0];
    let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
    let total = 3 + length;
    if buf.len() < total {
        return None;
    }

    let payload = buf[3..total].to_vec();
    buf.drain(0..total);
    Some((frame_type, payload))
}

fn parse_uuid_payload(payload: &[u8]) -> Option<Uuid> {
    match payload.len() {
        16 => {
            let bytes: [u8; 16] = payload.try_into().ok()?;
            Some(Uuid::from_bytes(bytes))
        }
        36 => std::str::from_utf8(payload).ok()?.parse().ok(),
        _ => None,
    }
}

/// Feeds `chunks` into `take_frame` one chunk at a time, as if each arrived
/// in a separate TCP read, collecting every complete frame decoded along
/// the way.
#[cfg(test)]
fn drain_frames_across_chunks(chunks: &[&[u8]]) -> Vec<(u8, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(frame) = take_frame(&mut buf) {
            frames.push(frame);
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid_frame(uuid: Uuid) -> Vec<u8> {
        let bytes = uuid.into_bytes();
        let mut frame = vec![FRAME_TYPE_UUID, 0, 16];
        frame.extend_from_slice(&bytes);
        frame
    }

    fn audio_frame(payload: &[u8]) -> Vec<u8> {
        let len = (payload.len() as u16).to_be_bytes();
        let mut frame = vec![FRAME_TYPE_AUDIO, len[0], len[1]];
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn take_frame_returns_none_on_partial_header() {
        let mut buf = vec![FRAME_TYPE_AUDIO, 0];
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn take_frame_returns_none_on_partial_payload() {
        let mut buf = vec![FRAME_TYPE_AUDIO, 0, 4, 0xAA, 0xBB];
        assert!(take_frame(&mut buf).is_none());
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn take_frame_parses_one_complete_frame_and_leaves_the_rest() {
        let mut buf = vec![FRAME_TYPE_AUDIO, 0, 2, 0x11, 0x22, FRAME_TYPE_DTMF, 0, 0];
        let (frame_type, payload) = take_frame(&mut buf).expect("first frame complete");
        assert_eq!(frame_type, FRAME_TYPE_AUDIO);
        assert_eq!(payload, vec![0x11, 0x22]);
        assert_eq!(buf, vec![FRAME_TYPE_DTMF, 0, 0]);
    }

    #[test]
    fn uuid_frame_split_byte_by_byte_is_correctly_reassembled() {
        let uuid = Uuid::new_v4();
        let frame = uuid_frame(uuid);
        let chunks: Vec<&[u8]> = frame.iter().map(std::slice::from_ref).collect();
        let frames = drain_frames_across_chunks(&chunks);
        assert_eq!(frames.len(), 1);
        let (frame_type, payload) = &frames[0];
        assert_eq!(*frame_type, FRAME_TYPE_UUID);
        assert_eq!(parse_uuid_payload(payload), Some(uuid));
    }

    #[test]
    fn uuid_frame_split_across_header_and_payload_boundary_reassembles() {
        let uuid = Uuid::new_v4();
        let frame = uuid_frame(uuid);
        // Split right in the middle of the header (after the type byte).
        let (first, second) = frame.split_at(1);
        let frames = drain_frames_across_chunks(&[first, second]);
        assert_eq!(frames.len(), 1);
        assert_eq!(parse_uuid_payload(&frames[0].1), Some(uuid));
    }

    #[test]
    fn audio_frame_straddling_a_buffer_boundary_is_held_until_complete() {
        let payload = vec![0x7Fu8; 160];
        let frame = audio_frame(&payload);
        // Split partway through the payload: the frame must not be yielded
        // until the second chunk arrives.
        let (first, second) = frame.split_at(frame.len() - 40);

        let mut buf = Vec::new();
        buf.extend_from_slice(first);
        assert!(take_frame(&mut buf).is_none(), "frame must be held, not yielded early");

        buf.extend_from_slice(second);
        let (frame_type, got_payload) = take_frame(&mut buf).expect("frame now complete");
        assert_eq!(frame_type, FRAME_TYPE_AUDIO);
        assert_eq!(got_payload, payload);
    }

    #[test]
    fn two_frames_arriving_in_one_chunk_are_both_decoded_in_order() {
        let mut combined = audio_frame(&[0x01, 0x02]);
        combined.extend_from_slice(&audio_frame(&[0x03, 0x04]));
        let frames = drain_frames_across_chunks(&[&combined]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, vec![0x01, 0x02]);
        assert_eq!(frames[1].1, vec![0x03, 0x04]);
    }

    #[test]
    fn uuid_ascii_form_parses_same_as_binary_form() {
        let uuid = Uuid::new_v4();
        let ascii = uuid.to_string();
        assert_eq!(ascii.len(), 36);
        assert_eq!(parse_uuid_payload(ascii.as_bytes()), Some(uuid));
        assert_eq!(parse_uuid_payload(uuid.as_bytes()), Some(uuid));
    }
}
