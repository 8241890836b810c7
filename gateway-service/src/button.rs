//! Button State Machine: per-button press → hold-timer → release lifecycle.
//!
//! "Still held" is inferred from the bus repeating the same `#NAAAAAA`
//! frame while the button stays down; release is declared once the
//! repeats stop arriving for `release_window_ms`. We detect that with a
//! per-press "touch sequence" counter: every repeated frame bumps it, and
//! a watchdog task sleeps for the release window then checks whether its
//! captured sequence is still current — if so, nothing arrived meanwhile
//! and the button has been released.
//!
//! Hold-timer milestones (1s/2s/3s) are scheduled the same way, keyed by
//! `press_id` rather than the touch sequence so they fire once regardless
//! of repeats.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::config::{ButtonConfig, ConfigSink};
use crate::events::{now_ts_ms, EngineEvent, EventSender};
use crate::types::{ButtonAddress, Group, ModuleAddress};

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);
const HOLD_MILESTONES_S: [u64; 3] = [1, 2, 3];

/// Per-button ephemeral press record.
struct PressCycle {
    press_id: u64,
    press_instant: Instant,
    touch_seq: u64,
    milestones_fired: [bool; 3],
}

struct Inner {
    cycles: HashMap<ButtonAddress, PressCycle>,
    last_release: HashMap<ButtonAddress, Instant>,
    next_press_id: u64,
}

/// Callback invoked once a press cycle fully resolves (release detected):
/// enqueues a refresh for each of the button's impacted modules and emits
/// `button_operation` once that refresh completes.
///
/// Hand-written `-> Pin<Box<dyn Future>>` rather than pulling in an
/// async-trait crate: one method, called from one place, doesn't earn the
/// extra dependency.
pub trait ReleaseFollowUp: Send + Sync {
    fn refresh_impacted(
        &self,
        address: ButtonAddress,
        module: ModuleAddress,
        group: Group,
        operation_time_s: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

pub struct ButtonHub {
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
    buttons: HashMap<ButtonAddress, ButtonConfig>,
    long_press_threshold: Duration,
    release_window: Duration,
    follow_up: Arc<dyn ReleaseFollowUp>,
    /// Host hook for the one persisted-state exception the core allows:
    /// addresses not in `buttons` get reported here so the host can append
    /// them to its config file. `None` when the host doesn't care to track it.
    config_sink: Option<Arc<dyn ConfigSink>>,
}

impl ButtonHub {
    pub fn new(
        buttons: HashMap<ButtonAddress, ButtonConfig>,
        events: EventSender,
        long_press_threshold_ms: u64,
        release_window_ms: u64,
        follow_up: Arc<dyn ReleaseFollowUp>,
    ) -> Arc<Self> {
        Self::with_config_sink(buttons, events, long_press_threshold_ms, release_window_ms, follow_up, None)
    }

    pub fn with_config_sink(
        buttons: HashMap<ButtonAddress, ButtonConfig>,
        events: EventSender,
        long_press_threshold_ms: u64,
        release_window_ms: u64,
        follow_up: Arc<dyn ReleaseFollowUp>,
        config_sink: Option<Arc<dyn ConfigSink>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(Inner {
                cycles: HashMap::new(),
                last_release: HashMap::new(),
                next_press_id: 1,
            })),
            events,
            buttons,
            long_press_threshold: Duration::from_millis(long_press_threshold_ms),
            release_window: Duration::from_millis(
                if release_window_ms == 0 { 400 } else { release_window_ms },
            ),
            follow_up,
            config_sink,
        })
    }

    /// Called by the Listener for every `#NAAAAAA` frame observed.
    pub async fn on_frame(self: &Arc<Self>, address: ButtonAddress) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        if let Some(cycle) = inner.cycles.get_mut(&address) {
            cycle.touch_seq += 1;
            let seq = cycle.touch_seq;
            drop(inner);
            self.arm_release_watchdog(address, seq);
            return;
        }

        if let Some(last_release) = inner.last_release.get(&address) {
            if now.saturating_duration_since(*last_release) < DEBOUNCE_WINDOW {
                debug!(address = %address, "suppressing duplicate press within debounce window");
                return;
            }
        }

        let press_id = inner.next_press_id;
        inner.next_press_id += 1;
        inner.cycles.insert(
            address,
            PressCycle {
                press_id,
                press_instant: now,
                touch_seq: 0,
                milestones_fired: [false; 3],
            },
        );
        drop(inner);

        self.events.send(EngineEvent::ButtonPressed {
            address,
            press_id,
            ts_ms: now_ts_ms(),
        });

        for (idx, seconds) in HOLD_MILESTONES_S.iter().enumerate() {
            self.arm_milestone(address, press_id, idx, Duration::from_secs(*seconds));
        }
        self.arm_release_watchdog(address, 0);
    }

    fn arm_milestone(self: &Arc<Self>, address: ButtonAddress, press_id: u64, idx: usize, after: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let mut inner = this.inner.lock().await;
            let still_held = match inner.cycles.get_mut(&address) {
                Some(cycle) if cycle.press_id == press_id => {
                    cycle.milestones_fired[idx] = true;
                    true
                }
                _ => false,
            };
            drop(inner);
            if still_held {
                this.events.send(EngineEvent::ButtonTimer {
                    address,
                    press_id,
                    milestone: (idx + 1) as u8,
                    ts_ms: now_ts_ms(),
                });
            }
        });
    }

    fn arm_release_watchdog(self: &Arc<Self>, address: ButtonAddress, seq_at_arm: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.release_window).await;
            this.maybe_finalize_release(address, seq_at_arm).await;
        });
    }

    async fn maybe_finalize_release(self: &Arc<Self>, address: ButtonAddress, seq_at_arm: u64) {
        let (press_id, duration_s) = {
            let mut inner = self.inner.lock().await;
            let still_current = matches!(
                inner.cycles.get(&address),
                Some(cycle) if cycle.touch_seq == seq_at_arm
            );
            if !still_current {
                return;
            }
            let cycle = inner.cycles.remove(&address).expect("checked above");
            let duration_s = cycle.press_instant.elapsed().as_secs_f64();
            inner.last_release.insert(address, Instant::now());
            (cycle.press_id, duration_s)
        };

        self.events.send(EngineEvent::ButtonReleased {
            address,
            press_id,
            duration_s,
            ts_ms: now_ts_ms(),
        });

        if duration_s < self.long_press_threshold.as_secs_f64() {
            self.events.send(EngineEvent::ShortButtonPressed {
                address,
                press_id,
                duration_s,
            });
        } else {
            self.events.send(EngineEvent::LongButtonPressed {
                address,
                press_id,
                duration_s,
            });
        }

        let bucket = (duration_s.floor() as i64).clamp(0, 3) as u8;
        self.events.send(EngineEvent::ButtonPressedBucket {
            address,
            press_id,
            bucket,
        });

        match self.buttons.get(&address) {
            Some(cfg) => {
                let operation_time_s = cfg.operation_time.unwrap_or(40);
                for impacted in &cfg.impacted_module {
                    self.follow_up
                        .refresh_impacted(address, impacted.address, impacted.group.into(), operation_time_s)
                        .await;
                }
            }
            None => {
                if let Some(sink) = &self.config_sink {
                    sink.record_observed_button(address);
                }
            }
        }
    }
}
