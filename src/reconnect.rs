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

//! Exponential backoff with jitter, shared by the PBX control client and the
//! realtime AI client, plus the process-wide [`ReconnectManager`] (C8) that
//! actually schedules the resulting delays. Each caller still owns its own
//! [`Backoff`] instance to track attempt counts and compute delays; the
//! manager only owns the single ticker that waits them out.

use rand::Rng;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

/// Tracks attempt count and hands back the next delay, or `None` once the
/// budget is exhausted.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }

    /// Advances the attempt counter and returns the delay to wait before the
    /// next connect attempt, or `None` if the budget is exhausted. Jitter is
    /// uniform in `[-20%, +20%]` of the unjittered delay.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.exhausted() {
            return None;
        }
        self.attempts += 1;
        let exp = self.policy.factor.powi(self.attempts as i32 - 1);
        let base_delay = (self.policy.base.as_secs_f64() * exp).min(self.policy.cap.as_secs_f64());
        let jitter_factor = rand::rng().random_range(0.8..=1.2);
        Some(Duration::from_secs_f64(base_delay * jitter_factor))
    }
}

struct PendingReconnect {
    execute_at: Instant,
    attempt: u32,
    notify: oneshot::Sender<u32>,
}

struct TickerState {
    pending: HashMap<String, PendingReconnect>,
    running: bool,
}

/// C8: a single process-wide 500 ms ticker that all reconnecting components
/// share instead of each sleeping on its own timer. `schedule` records
/// `executeAt = now + delay` in a map (a call already pending is left alone);
/// the ticker fires every ready entry, removes it, and resolves the
/// caller's receiver with the attempt number passed to `schedule`. The
/// ticker task is only alive while the map is non-empty, spawned lazily on
/// the first `schedule` and torn down the tick it finds nothing left.
pub struct ReconnectManager {
    state: Arc<Mutex<TickerState>>,
}

impl Default for ReconnectManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectManager {
    const TICK: Duration = Duration::from_millis(500);

    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TickerState {
                pending: HashMap::new(),
                running: false,
            })),
        }
    }

    /// Schedules `call_id` to fire after `delay`. Returns a receiver that
    /// resolves with `attempt` once the ticker fires it; returns `None` if
    /// `call_id` already has a reconnect pending, matching the spec's
    /// "duplicates are ignored".
    pub fn schedule(&self, call_id: String, delay: Duration, attempt: u32) -> Option<oneshot::Receiver<u32>> {
        let mut state = self.state.lock().expect("reconnect manager mutex poisoned");
        if state.pending.contains_key(&call_id) {
            return None;
        }
        let (notify, rx) = oneshot::channel();
        state.pending.insert(
            call_id,
            PendingReconnect {
                execute_at: Instant::now() + delay,
                attempt,
                notify,
            },
        );
        if !state.running {
            state.running = true;
            Self::spawn_ticker(self.state.clone());
        }
        Some(rx)
    }

    fn spawn_ticker(state: Arc<Mutex<TickerState>>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ReconnectManager::TICK);
            loop {
                interval.tick().await;
                let now = Instant::now();
                let mut guard = state.lock().expect("reconnect manager mutex poisoned");
                let ready: Vec<String> = guard
                    .pending
                    .iter()
                    .filter(|(_, entry)| entry.execute_at <= now)
                    .map(|(call_id, _)| call_id.clone())
                    .collect();
                for call_id in ready {
                    if let Some(entry) = guard.pending.remove(&call_id) {
                        trace!(call_id = %call_id, attempt = entry.attempt, "reconnect ticker firing");
                        let _ = entry.notify.send(entry.attempt);
                    }
                }
                if guard.pending.is_empty() {
                    guard.running = false;
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(3),
            factor: 1.5,
            cap: Duration::from_secs(30),
            max_attempts: 10,
        }
    }

    #[test]
    fn delays_grow_and_are_capped() {
        let mut backoff = Backoff::new(policy());
        let mut previous = Duration::ZERO;
        for _ in 0..10 {
            let delay = backoff.next_delay().expect("budget not exhausted");
            assert!(delay >= previous || delay <= Duration::from_secs(36));
            previous = delay;
        }
        assert!(backoff.exhausted());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn reset_clears_attempt_count() {
        let mut backoff = Backoff::new(policy());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }

    #[test]
    fn jitter_stays_within_plus_minus_20_percent() {
        let mut backoff = Backoff::new(BackoffPolicy {
            base: Duration::from_secs(1),
            factor: 1.0,
            cap: Duration::from_secs(30),
            max_attempts: 50,
        });
        for _ in 0..50 {
            let delay = backoff.next_delay().expect("budget not exhausted");
            assert!(delay >= Duration::from_millis(800), "delay {delay:?} below 0.8x");
            assert!(delay <= Duration::from_millis(1200), "delay {delay:?} above 1.2x");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manager_fires_after_delay() {
        let manager = ReconnectManager::new();
        let rx = manager
            .schedule("call-1".to_owned(), Duration::from_millis(700), 3)
            .expect("first schedule for a call id succeeds");
        tokio::time::advance(Duration::from_secs(2)).await;
        let attempt = rx.await.expect("ticker fires the receiver");
        assert_eq!(attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn manager_ignores_duplicate_schedule() {
        let manager = ReconnectManager::new();
        let _rx = manager
            .schedule("call-1".to_owned(), Duration::from_secs(5), 1)
            .expect("first schedule succeeds");
        let second = manager.schedule("call-1".to_owned(), Duration::from_secs(5), 2);
        assert!(second.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn manager_restarts_ticker_after_draining() {
        let manager = ReconnectManager::new();
        let rx1 = manager
            .schedule("call-1".to_owned(), Duration::from_millis(500), 1)
            .expect("first schedule succeeds");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rx1.await.expect("fires"), 1);

        // ticker should have torn itself down; scheduling again must spawn a new one.
        tokio::time::advance(Duration::from_secs(1)).await;
        let rx2 = manager
            .schedule("call-1".to_owned(), Duration::from_millis(500), 2)
            .expect("schedule after drain succeeds");
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rx2.await.expect("fires"), 2);
    }
}
