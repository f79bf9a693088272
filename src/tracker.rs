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

//! Process-wide registry mapping PBX channel ids, correlation ids and
//! AudioSocket UUIDs to a mutable per-call state record. One [`ChannelTracker`]
//! is constructed at startup and shared (via `Arc`) with every other
//! component instead of living behind a global singleton.

use crate::error::{TrackerError, TrackerResult};
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallState {
    Admitted,
    Answered,
    PipelineSetup,
    MediaBridged,
    AwaitingAiSession,
    Streaming,
    Terminating,
    Terminated,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceBundle {
    pub main_channel_handle: Option<String>,
    pub snoop_channel_handle: Option<String>,
    pub local_channel_handle: Option<String>,
    pub main_bridge_handle: Option<String>,
    pub snoop_bridge_handle: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CallRecord {
    pub channel_id: String,
    pub correlation_id: String,
    pub patient_id: Option<String>,
    pub state: CallState,
    pub resources: ResourceBundle,
    pub audio_socket_uuid: Option<Uuid>,
    pub rtp_ingress_ssrc: Option<u32>,
    pub conversation_id: Option<String>,
    pub recording_name: Option<String>,
    pub start_time: u64,
    pub last_activity: u64,
}

impl CallRecord {
    pub fn new(channel_id: String, correlation_id: String, patient_id: Option<String>) -> Self {
        let now = monotonic_millis();
        Self {
            channel_id,
            correlation_id,
            patient_id,
            state: CallState::Admitted,
            resources: ResourceBundle::default(),
            audio_socket_uuid: None,
            rtp_ingress_ssrc: None,
            conversation_id: None,
            recording_name: None,
            start_time: now,
            last_activity: now,
        }
    }

    /// Enforces the monotonic partial order: a call in a later state cannot
    /// regress, so re-entrant transitions (e.g. cleanup invoked twice) are
    /// harmless no-ops rather than corrupting state.
    pub fn advance_state(&mut self, next: CallState) {
        if next > self.state {
            self.state = next;
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = monotonic_millis();
    }
}

fn monotonic_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Single process-wide registry, constructed once and shared by `Arc`.
#[derive(Default)]
pub struct ChannelTracker {
    records: DashMap<String, Arc<Mutex<CallRecord>>>,
    uuid_index: DashMap<Uuid, String>,
}

impl ChannelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(self, patient_id))]
    pub fn admit(
        &self,
        channel_id: String,
        correlation_id: String,
        patient_id: Option<String>,
    ) -> TrackerResult<Arc<Mutex<CallRecord>>> {
        if self.records.contains_key(&channel_id) {
            return Err(TrackerError::DuplicateChannel(channel_id));
        }
        let record = Arc::new(Mutex::new(CallRecord::new(
            channel_id.clone(),
            correlation_id,
            patient_id,
        )));
        self.records.insert(channel_id, record.clone());
        Ok(record)
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<Mutex<CallRecord>>> {
        self.records.get(channel_id).map(|r| r.clone())
    }

    /// Applies `mutator` under the record's own lock; a no-op if the channel
    /// is not (or no longer) tracked.
    pub async fn update<F>(&self, channel_id: &str, mutator: F)
    where
        F: FnOnce(&mut CallRecord),
    {
        if let Some(record) = self.get(channel_id) {
            let mut guard = record.lock().await;
            mutator(&mut guard);
        }
    }

    /// Writes both directions of the UUID↔channel mapping. A UUID already
    /// bound to a different channel is rejected silently (logged only),
    /// mirroring the PBX control plane's tolerance of stray re-handshakes.
    #[instrument(skip(self))]
    pub async fn bind_uuid(&self, channel_id: &str, uuid: Uuid) {
        if let Some(existing) = self.uuid_index.get(&uuid) {
            if existing.value() != channel_id {
                warn!(
                    %uuid,
                    existing = %existing.value(),
                    attempted = %channel_id,
                    "rejecting cross-binding of audio-socket uuid"
                );
                return;
            }
        }
        self.uuid_index.insert(uuid, channel_id.to_owned());
        self.update(channel_id, |record| {
            record.audio_socket_uuid = Some(uuid);
        })
        .await;
    }

    pub fn find_by_uuid(&self, uuid: &Uuid) -> Option<String> {
        self.uuid_index.get(uuid).map(|e| e.value().clone())
    }

    /// Removes the record and its UUID reverse entry (if any), returning the
    /// final snapshot so cleanup can run without re-entering the lock.
    #[instrument(skip(self))]
    pub async fn remove(&self, channel_id: &str) -> Option<CallRecord> {
        let (_, record) = self.records.remove(channel_id)?;
        let snapshot = record.lock().await.clone();
        if let Some(uuid) = snapshot.audio_socket_uuid {
            self.uuid_index.remove(&uuid);
        }
        Some(snapshot)
    }

    pub async fn resources(&self, channel_id: &str) -> Option<ResourceBundle> {
        let record = self.get(channel_id)?;
        Some(record.lock().await.resources.clone())
    }

    /// Read-only linear scan, used by StasisStart to find the parent call of
    /// a newly spawned snoop channel.
    pub async fn find_by_snoop_channel(&self, snoop_channel_id: &str) -> Option<String> {
        for entry in self.records.iter() {
            let guard = entry.value().lock().await;
            if guard.resources.snoop_channel_handle.as_deref() == Some(snoop_channel_id) {
                return Some(guard.channel_id.clone());
            }
        }
        None
    }

    /// Point-in-time snapshot of every tracked call, for the admin surface.
    pub async fn snapshot_all(&self) -> Vec<CallRecord> {
        let mut out = Vec::with_capacity(self.records.len());
        for entry in self.records.iter() {
            out.push(entry.value().lock().await.clone());
        }
        out
    }

    /// Point-in-time snapshot of a single call, for the admin surface.
    pub async fn snapshot(&self, channel_id: &str) -> Option<CallRecord> {
        let record = self.get(channel_id)?;
        Some(record.lock().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admit_rejects_duplicate_channel() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        let err = tracker.admit("chan-1".into(), "corr-2".into(), None);
        assert!(matches!(err, Err(TrackerError::DuplicateChannel(_))));
    }

    #[tokio::test]
    async fn bind_and_find_uuid_round_trips() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        let uuid = Uuid::new_v4();
        tracker.bind_uuid("chan-1", uuid).await;
        assert_eq!(tracker.find_by_uuid(&uuid).as_deref(), Some("chan-1"));
    }

    #[tokio::test]
    async fn cross_binding_is_rejected() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        tracker
            .admit("chan-2".into(), "corr-2".into(), None)
            .unwrap();
        let uuid = Uuid::new_v4();
        tracker.bind_uuid("chan-1", uuid).await;
        tracker.bind_uuid("chan-2", uuid).await;
        assert_eq!(tracker.find_by_uuid(&uuid).as_deref(), Some("chan-1"));
    }

    #[tokio::test]
    async fn remove_clears_uuid_reverse_index() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        let uuid = Uuid::new_v4();
        tracker.bind_uuid("chan-1", uuid).await;
        tracker.remove("chan-1").await;
        assert!(tracker.find_by_uuid(&uuid).is_none());
        assert!(tracker.get("chan-1").is_none());
    }

    #[tokio::test]
    async fn state_advance_is_monotonic() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        tracker
            .update("chan-1", |r| r.advance_state(CallState::Streaming))
            .await;
        tracker
            .update("chan-1", |r| r.advance_state(CallState::Answered))
            .await;
        let record = tracker.get("chan-1").unwrap();
        assert_eq!(record.lock().await.state, CallState::Streaming);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let tracker = ChannelTracker::new();
        tracker
            .admit("chan-1".into(), "corr-1".into(), None)
            .unwrap();
        assert!(tracker.remove("chan-1").await.is_some());
        assert!(tracker.remove("chan-1").await.is_none());
    }
}
