//! The Listener: owns `TransportReader` exclusively, reads one CR-delimited
//! line at a time, and fans it out to whichever component cares.
//!
//! Four lanes, keyed off the first character and, for `$` frames, either
//! payload shape (length) or decoded function code — see
//! `crate::scheduler`'s module doc for why the state-answer family has no
//! function-code byte at all and must be recognized by length instead:
//!
//! - `#N` button frames → the button hub.
//! - `$`-frame feedback/read/write answers (the fixed 9-byte state-answer
//!   shape) → the state cache, the scheduler's awaiting slot if one is
//!   outstanding for this module, and a feedback sink hook (cover-channel
//!   reconciliation lives there).
//! - `$`-frame ACK echoes (`0x05`, 3-byte payload) → the scheduler's
//!   awaiting slot.
//! - `$`-frame refresh/discovery hints (`0x05`, 4-byte payload) → recorded
//!   as "next answer's group" so a spontaneous state-answer push can be
//!   attributed to the right group.
//!
//! Anything else (malformed frame, unrecognized function code) is logged
//! and dropped — `$` lines arrive unsolicited, so there is no caller to
//! report a framing error back to. A CRC8-rejected frame gets one
//! exception: it short-circuits the scheduler's awaiting slot (see
//! `notify_crc_reject`) so retry doesn't wait out the full ACK/answer
//! timeout for a frame already known to be garbage.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::button::ButtonHub;
use crate::codec::{extract_button_address, parse_dollar_frame};
use crate::error::FrameRejectReason;
use crate::events::{EngineEvent, EventSender};
use crate::scheduler::{
    SharedAwaiting, ANSWER_PAYLOAD_LEN, FN_ACK_OR_REFRESH, FN_READ_GROUP1, FN_READ_GROUP2,
};
use crate::state_cache::StateCache;
use crate::transport::TransportReader;
use crate::types::{Group, ModuleAddress};

/// Hook for cross-cutting reconciliation that doesn't belong in the
/// generic cache-update path (the cover estimator watching for a `0x00`
/// group byte on a roller channel). The engine implements this.
pub trait FeedbackSink: Send + Sync {
    fn on_feedback(&self, module: ModuleAddress, group: Group, data: [u8; 6]);
}

struct RefreshHint {
    module: ModuleAddress,
    group: Group,
}

/// The dispatch logic proper, kept separate from `TransportReader`
/// ownership so it can be exercised in tests without opening a transport.
struct Dispatcher {
    cache: Arc<StateCache>,
    awaiting: SharedAwaiting,
    events: EventSender,
    buttons: Arc<ButtonHub>,
    feedback_sink: Arc<dyn FeedbackSink>,
    last_hint: Option<RefreshHint>,
}

pub struct Listener {
    reader: TransportReader,
    dispatcher: Dispatcher,
}

impl Listener {
    pub fn new(
        reader: TransportReader,
        cache: Arc<StateCache>,
        awaiting: SharedAwaiting,
        events: EventSender,
        buttons: Arc<ButtonHub>,
        feedback_sink: Arc<dyn FeedbackSink>,
    ) -> Self {
        Self {
            reader,
            dispatcher: Dispatcher {
                cache,
                awaiting,
                events,
                buttons,
                feedback_sink,
                last_hint: None,
            },
        }
    }

    /// Read and dispatch frames until the transport closes.
    pub async fn run(mut self) {
        loop {
            let line = match self.reader.read_line().await {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "listener transport lost, exiting read loop");
                    return;
                }
            };
            if line.is_empty() {
                continue;
            }
            self.dispatcher.dispatch(&line).await;
        }
    }
}

impl Dispatcher {
    async fn dispatch(&mut self, line: &str) {
        if line.starts_with('#') {
            if let Some(hex) = extract_button_address(line) {
                if let Ok(address) = crate::types::ButtonAddress::parse(hex) {
                    self.buttons.on_frame(address).await;
                }
            }
            return;
        }

        if !line.contains('$') {
            trace!(line, "ignoring line with no recognizable frame marker");
            return;
        }

        let frame = match parse_dollar_frame(line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(line, error = %e, "dropping unparseable $ frame");
                if e == FrameRejectReason::Crc8Mismatch {
                    self.notify_crc_reject().await;
                }
                return;
            }
        };

        if frame.payload.len() == ANSWER_PAYLOAD_LEN {
            self.handle_feedback_answer(&frame.payload).await;
            return;
        }

        match frame.function_code() {
            Some(FN_ACK_OR_REFRESH) => self.handle_ack_or_refresh(&frame.payload).await,
            Some(other) => trace!(function_code = format!("{:02X}", other), "unhandled function code"),
            None => {}
        }
    }

    /// Tells whatever command the scheduler currently has in flight that
    /// its frame was just rejected for a CRC8 mismatch, so it can retry
    /// immediately instead of waiting out the full ACK/answer timeout.
    async fn notify_crc_reject(&self) {
        let mut slot = self.awaiting.lock().await;
        if let Some(tx) = slot.crc_reject_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn handle_feedback_answer(&mut self, payload: &[u8]) {
        debug_assert_eq!(payload.len(), ANSWER_PAYLOAD_LEN, "caller dispatches on this length");
        let module = ModuleAddress::from_wire_bytes(payload[0], payload[1]);
        let mut data = [0u8; 6];
        data.copy_from_slice(&payload[3..9]);

        let group = self.resolve_answer_group(module).await;

        if self.cache.contains(module).await {
            let _ = self.cache.apply_feedback(module, group, &data).await;
            self.events.send(EngineEvent::Refreshed { module });
            self.feedback_sink.on_feedback(module, group, data);
        } else {
            debug!(module = %module, "feedback answer for unconfigured module, ignoring");
        }

        self.complete_awaiting_answer(module, data).await;
        self.last_hint = None;
    }

    /// Which group a spontaneous or correlated state-answer belongs to:
    /// prefer the scheduler's outstanding expectation for this module,
    /// then a refresh hint observed from a prior `0x05` broadcast, and
    /// only default to group 1 if neither is available.
    async fn resolve_answer_group(&self, module: ModuleAddress) -> Group {
        {
            let slot = self.awaiting.lock().await;
            if slot.module == Some(module) {
                if let Some(group) = slot.answer_group {
                    return group;
                }
            }
        }
        if let Some(hint) = &self.last_hint {
            if hint.module == module {
                return hint.group;
            }
        }
        Group::One
    }

    async fn complete_awaiting_answer(&self, module: ModuleAddress, data: [u8; 6]) {
        let mut slot = self.awaiting.lock().await;
        if slot.module == Some(module) {
            if let Some(tx) = slot.answer_tx.take() {
                let _ = tx.send(data);
            }
        }
    }

    async fn handle_ack_or_refresh(&mut self, payload: &[u8]) {
        match payload.len() {
            3 => {
                let module = ModuleAddress::from_wire_bytes(payload[1], payload[2]);
                let mut slot = self.awaiting.lock().await;
                if slot.module == Some(module) {
                    if let Some(tx) = slot.ack_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
            4 => {
                let hinted_fn = payload[1];
                let module = ModuleAddress::from_wire_bytes(payload[2], payload[3]);
                let group = match hinted_fn {
                    FN_READ_GROUP1 => Group::One,
                    FN_READ_GROUP2 => Group::Two,
                    _ => {
                        debug!(function_code = format!("{:02X}", hinted_fn), "unrecognized refresh hint function code");
                        return;
                    }
                };
                self.last_hint = Some(RefreshHint { module, group });
            }
            other => debug!(len = other, "0x05 payload has unexpected length"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_dollar_frame;
    use crate::events::EventBus;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        calls: StdMutex<Vec<(ModuleAddress, Group, [u8; 6])>>,
    }

    impl FeedbackSink for RecordingSink {
        fn on_feedback(&self, module: ModuleAddress, group: Group, data: [u8; 6]) {
            self.calls.lock().unwrap().push((module, group, data));
        }
    }

    fn addr() -> ModuleAddress {
        ModuleAddress::parse("4707").unwrap()
    }

    struct NoopFollowUp;
    impl crate::button::ReleaseFollowUp for NoopFollowUp {
        fn refresh_impacted(
            &self,
            _address: crate::types::ButtonAddress,
            _module: ModuleAddress,
            _group: Group,
            _operation_time_s: u32,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
            Box::pin(async {})
        }
    }

    fn make_dispatcher(
        cache: Arc<StateCache>,
        awaiting: SharedAwaiting,
        sink: Arc<RecordingSink>,
    ) -> (Dispatcher, tokio::sync::broadcast::Receiver<EngineEvent>) {
        let bus = EventBus::new(16);
        let rx = bus.subscribe();
        let buttons = ButtonHub::new(Default::default(), bus.sender(), 500, 400, Arc::new(NoopFollowUp));
        let dispatcher = Dispatcher {
            cache,
            awaiting,
            events: bus.sender(),
            buttons,
            feedback_sink: sink,
            last_hint: None,
        };
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn feedback_answer_updates_cache_and_emits_refreshed() {
        let cache = Arc::new(StateCache::new([addr()]));
        let awaiting = Default::default();
        let sink = Arc::new(RecordingSink { calls: StdMutex::new(Vec::new()) });
        let (mut dispatcher, mut rx) = make_dispatcher(cache.clone(), awaiting, sink.clone());

        let payload = {
            let mut p = vec![];
            p.extend_from_slice(&addr().to_wire_bytes());
            p.push(0x00); // reserved byte, unused by the protocol
            p.extend_from_slice(&[0xFF, 0, 0, 0, 0, 0]);
            p
        };
        let frame = build_dollar_frame(&payload);
        dispatcher.dispatch(&frame).await;

        assert_eq!(cache.get(addr(), 1).await.unwrap(), 0xFF);
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev, EngineEvent::Refreshed { module: addr() });
    }

    #[tokio::test]
    async fn spec_scenario_4_literal_frame_updates_cache_and_emits_refreshed() {
        let module = addr();
        let cache = Arc::new(StateCache::new([module]));
        let awaiting = Default::default();
        let sink = Arc::new(RecordingSink { calls: StdMutex::new(Vec::new()) });
        let (mut dispatcher, mut rx) = make_dispatcher(cache.clone(), awaiting, sink.clone());

        // Literal worked example from the protocol's feedback-answer scenario.
        dispatcher.dispatch("$1C074700FF0000000000CCAEA3").await;

        assert_eq!(cache.get(module, 1).await.unwrap(), 0xFF);
        for ch in 2..=6 {
            assert_eq!(cache.get(module, ch).await.unwrap(), 0x00);
        }
        assert_eq!(sink.calls.lock().unwrap().len(), 1);
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev, EngineEvent::Refreshed { module });
    }

    #[tokio::test]
    async fn ack_echo_completes_awaiting_slot() {
        let cache = Arc::new(StateCache::new([addr()]));
        let awaiting: SharedAwaiting = Default::default();
        let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
        {
            let mut slot = awaiting.lock().await;
            slot.module = Some(addr());
            slot.ack_tx = Some(ack_tx);
        }
        let sink = Arc::new(RecordingSink { calls: StdMutex::new(Vec::new()) });
        let (mut dispatcher, _rx) = make_dispatcher(cache, awaiting, sink);

        let payload = {
            let mut p = vec![0x05u8];
            p.extend_from_slice(&addr().to_wire_bytes());
            p
        };
        let frame = build_dollar_frame(&payload);
        dispatcher.dispatch(&frame).await;

        assert!(ack_rx.await.is_ok());
    }

    #[tokio::test]
    async fn button_frame_reaches_button_hub() {
        let cache = Arc::new(StateCache::new([]));
        let awaiting = Default::default();
        let sink = Arc::new(RecordingSink { calls: StdMutex::new(Vec::new()) });
        let (mut dispatcher, mut rx) = make_dispatcher(cache, awaiting, sink);

        dispatcher.dispatch("#N4ECB1A\r").await;
        let ev = rx.try_recv().unwrap();
        assert!(matches!(ev, EngineEvent::ButtonPressed { .. }));
    }
}
