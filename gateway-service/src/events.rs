//! Events emitted to the host.
//!
//! Implemented as a `tokio::sync::broadcast` channel: every component that
//! observes something worth telling the host about gets a cloneable
//! `EventSender`, and the host (or multiple hosts, e.g. a UI plus a
//! logger) subscribes independently. This message-passing approach avoids
//! cyclic back-references between the Button FSM, Scheduler, and Cache — a
//! background reader forwarding typed frames into a broadcast channel
//! rather than calling back into its producers directly, generalized to
//! multi-subscriber broadcast since several independent host listeners are
//! expected.

use tokio::sync::broadcast;

use crate::types::{ButtonAddress, Group, ModuleAddress};

/// Milliseconds since the Unix epoch — avoids pulling in a datetime crate
/// for a single timestamp field; the host can format this however it
/// likes.
pub fn now_ts_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Hold-timer milestone index (1, 2, or 3 seconds).
pub type TimerMilestone = u8;

/// Duration bucket for `pressed_<k>` events: `floor(duration_s)` clamped to
/// `{0,1,2,3}`.
pub type PressBucket = u8;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A fresh press began; `press_id` is unique per cycle.
    ButtonPressed {
        address: ButtonAddress,
        press_id: u64,
        ts_ms: u64,
    },
    /// A hold-timer milestone fired while the button is still held.
    ButtonTimer {
        address: ButtonAddress,
        press_id: u64,
        milestone: TimerMilestone,
        ts_ms: u64,
    },
    /// The button was released; `duration_s` is always present here.
    ButtonReleased {
        address: ButtonAddress,
        press_id: u64,
        duration_s: f64,
        ts_ms: u64,
    },
    ShortButtonPressed {
        address: ButtonAddress,
        press_id: u64,
        duration_s: f64,
    },
    LongButtonPressed {
        address: ButtonAddress,
        press_id: u64,
        duration_s: f64,
    },
    ButtonPressedBucket {
        address: ButtonAddress,
        press_id: u64,
        bucket: PressBucket,
    },
    /// Emitted once the post-release refresh of an impacted module
    /// completes.
    ButtonOperation {
        address: ButtonAddress,
        module: ModuleAddress,
        group: Group,
        operation_time_s: u32,
    },
    /// A module's cached state changed because of a feedback answer or a
    /// completed read/write.
    Refreshed { module: ModuleAddress },
}

/// Cloneable handle used by engine components to publish events. Dropping
/// every [`EventBus`]/subscriber closes the channel; publishing past that
/// point is a silent no-op (nobody is listening — not an error condition).
#[derive(Clone)]
pub struct EventSender {
    inner: broadcast::Sender<EngineEvent>,
}

impl EventSender {
    pub fn send(&self, event: EngineEvent) {
        // No subscribers is not an error: the bus has no guaranteed reader.
        let _ = self.inner.send(event);
    }
}

/// Owns the broadcast channel; the engine keeps one of these alive so the
/// channel doesn't close while components still hold an `EventSender`.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            inner: self.sender.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let tx = bus.sender();

        tx.send(EngineEvent::Refreshed {
            module: ModuleAddress::parse("4707").unwrap(),
        });

        let got = rx.recv().await.unwrap();
        assert_eq!(
            got,
            EngineEvent::Refreshed {
                module: ModuleAddress::parse("4707").unwrap()
            }
        );
    }

    #[test]
    fn send_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        let tx = bus.sender();
        tx.send(EngineEvent::Refreshed {
            module: ModuleAddress::parse("4707").unwrap(),
        });
    }
}
