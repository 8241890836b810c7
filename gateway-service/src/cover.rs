//! Per-channel roller/shutter position estimator.
//!
//! There is no position feedback on the wire — only "moving up", "moving
//! down", or "stopped" — so the estimator derives a percentage from a
//! monotonic clock and the channel's configured traversal time, the same
//! way the scheduler derives pacing from elapsed time rather than a bus
//! acknowledgement.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::types::ModuleAddress;

const DEFAULT_OPERATION_TIME_S: u32 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverState {
    Stopped,
    Opening,
    Closing,
}

/// Command value written to the wire for a given direction/stop.
pub const WIRE_OPEN: u8 = 0x01;
pub const WIRE_CLOSE: u8 = 0x02;
pub const WIRE_STOP: u8 = 0x00;

struct ChannelState {
    state: CoverState,
    position: f64,
    operation_time_s: u32,
    movement_start: Option<Instant>,
    position_at_start: f64,
}

impl ChannelState {
    fn new(operation_time_s: u32) -> Self {
        Self {
            state: CoverState::Stopped,
            position: 0.0,
            operation_time_s,
            movement_start: None,
            position_at_start: 0.0,
        }
    }

    /// Position update rule: elapsed time since movement start, scaled by
    /// the channel's full-traversal duration, added/subtracted from the
    /// position snapshot taken at the start of the movement.
    fn estimate_position(&self, now: Instant) -> f64 {
        match (self.state, self.movement_start) {
            (CoverState::Stopped, _) | (_, None) => self.position,
            (CoverState::Opening, Some(start)) => {
                let delta = now.saturating_duration_since(start).as_secs_f64()
                    / self.operation_time_s as f64
                    * 100.0;
                (self.position_at_start + delta).clamp(0.0, 100.0)
            }
            (CoverState::Closing, Some(start)) => {
                let delta = now.saturating_duration_since(start).as_secs_f64()
                    / self.operation_time_s as f64
                    * 100.0;
                (self.position_at_start - delta).clamp(0.0, 100.0)
            }
        }
    }

    fn begin(&mut self, state: CoverState, now: Instant) {
        self.position = self.estimate_position(now);
        self.position_at_start = self.position;
        self.movement_start = Some(now);
        self.state = state;
    }

    fn stop(&mut self, now: Instant) {
        self.position = self.estimate_position(now);
        self.movement_start = None;
        self.state = CoverState::Stopped;
    }
}

/// One channel's externally observable snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoverSnapshot {
    pub state: CoverState,
    pub position: u8,
}

/// Command a caller should send to the wire as a result of a cover
/// operation, plus an optional delay after which `stop` should be
/// re-issued.
pub struct CoverCommand {
    pub wire_value: u8,
    pub stop_after: Option<Duration>,
}

pub struct CoverEstimator {
    channels: Mutex<HashMap<(ModuleAddress, u8), ChannelState>>,
}

impl CoverEstimator {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn entry(&self, module: ModuleAddress, channel: u8, operation_time_s: u32) -> tokio::sync::MutexGuard<'_, HashMap<(ModuleAddress, u8), ChannelState>> {
        let mut map = self.channels.lock().await;
        map.entry((module, channel))
            .or_insert_with(|| ChannelState::new(operation_time_s));
        map
    }

    pub async fn snapshot(&self, module: ModuleAddress, channel: u8) -> CoverSnapshot {
        let now = Instant::now();
        let map = self.channels.lock().await;
        match map.get(&(module, channel)) {
            Some(ch) => CoverSnapshot {
                state: ch.state,
                position: ch.estimate_position(now).round() as u8,
            },
            None => CoverSnapshot {
                state: CoverState::Stopped,
                position: 0,
            },
        }
    }

    /// Record that a write command put the channel into `opening`.
    pub async fn note_opening(&self, module: ModuleAddress, channel: u8, operation_time_s: u32) {
        let now = Instant::now();
        let mut map = self.entry(module, channel, operation_time_s).await;
        map.get_mut(&(module, channel)).unwrap().begin(CoverState::Opening, now);
    }

    pub async fn note_closing(&self, module: ModuleAddress, channel: u8, operation_time_s: u32) {
        let now = Instant::now();
        let mut map = self.entry(module, channel, operation_time_s).await;
        map.get_mut(&(module, channel)).unwrap().begin(CoverState::Closing, now);
    }

    /// Record that a write command (ours or a feedback answer reconciling
    /// with the estimator) put the channel into `stopped`.
    pub async fn note_stopped(&self, module: ModuleAddress, channel: u8, operation_time_s: u32) {
        let now = Instant::now();
        let mut map = self.entry(module, channel, operation_time_s).await;
        map.get_mut(&(module, channel)).unwrap().stop(now);
    }

    /// `set_position`: compute direction and duration from the current
    /// estimate, returning the wire command plus how long to wait before
    /// issuing the matching stop.
    pub async fn set_position(
        &self,
        module: ModuleAddress,
        channel: u8,
        target_pct: u8,
        operation_time_s: u32,
    ) -> CoverCommand {
        let now = Instant::now();
        let mut map = self.entry(module, channel, operation_time_s).await;
        let ch = map.get_mut(&(module, channel)).unwrap();
        let current = ch.estimate_position(now);
        let target = target_pct as f64;
        let duration_s = (target - current).abs() / 100.0 * ch.operation_time_s as f64;
        let duration = Duration::from_secs_f64(duration_s.max(0.0));

        if (target - current).abs() < f64::EPSILON {
            ch.stop(now);
            return CoverCommand {
                wire_value: WIRE_STOP,
                stop_after: None,
            };
        }

        if target > current {
            ch.begin(CoverState::Opening, now);
            CoverCommand {
                wire_value: WIRE_OPEN,
                stop_after: Some(duration),
            }
        } else {
            ch.begin(CoverState::Closing, now);
            CoverCommand {
                wire_value: WIRE_CLOSE,
                stop_after: Some(duration),
            }
        }
    }

    /// Button-driven toggle: if currently moving, next press stops;
    /// otherwise opens (mirrors a physical up/down rocker wired to a
    /// single virtual button).
    pub async fn toggle(&self, module: ModuleAddress, channel: u8, operation_time_s: u32) -> CoverCommand {
        let now = Instant::now();
        let mut map = self.entry(module, channel, operation_time_s).await;
        let ch = map.get_mut(&(module, channel)).unwrap();
        match ch.state {
            CoverState::Stopped => {
                ch.begin(CoverState::Opening, now);
                CoverCommand {
                    wire_value: WIRE_OPEN,
                    stop_after: None,
                }
            }
            CoverState::Opening | CoverState::Closing => {
                ch.stop(now);
                CoverCommand {
                    wire_value: WIRE_STOP,
                    stop_after: None,
                }
            }
        }
    }
}

impl Default for CoverEstimator {
    fn default() -> Self {
        Self::new()
    }
}

pub fn default_operation_time_s() -> u32 {
    DEFAULT_OPERATION_TIME_S
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ModuleAddress {
        ModuleAddress::parse("9105").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn position_advances_while_opening() {
        let est = CoverEstimator::new();
        est.note_opening(addr(), 1, 40).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        let snap = est.snapshot(addr(), 1).await;
        assert_eq!(snap.state, CoverState::Opening);
        assert_eq!(snap.position, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_freezes_position() {
        let est = CoverEstimator::new();
        est.note_opening(addr(), 1, 40).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        est.note_stopped(addr(), 1, 40).await;
        tokio::time::advance(Duration::from_secs(20)).await;
        let snap = est.snapshot(addr(), 1).await;
        assert_eq!(snap.state, CoverState::Stopped);
        assert_eq!(snap.position, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn set_position_computes_proportional_duration() {
        let est = CoverEstimator::new();
        let cmd = est.set_position(addr(), 1, 50, 40).await;
        assert_eq!(cmd.wire_value, WIRE_OPEN);
        assert_eq!(cmd.stop_after, Some(Duration::from_secs(20)));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_opens_then_stops() {
        let est = CoverEstimator::new();
        let first = est.toggle(addr(), 1, 40).await;
        assert_eq!(first.wire_value, WIRE_OPEN);
        let second = est.toggle(addr(), 1, 40).await;
        assert_eq!(second.wire_value, WIRE_STOP);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_subtracts_position() {
        let est = CoverEstimator::new();
        est.note_opening(addr(), 1, 40).await;
        tokio::time::advance(Duration::from_secs(40)).await;
        est.note_stopped(addr(), 1, 40).await;
        est.note_closing(addr(), 1, 40).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        let snap = est.snapshot(addr(), 1).await;
        assert_eq!(snap.position, 75);
    }
}
