//! Command Scheduler: the single FIFO queue with pacing, ACK/answer
//! correlation, and bounded retry. The only component allowed to write to
//! the transport.
//!
//! ## Resolving the ACK/answer wire shapes
//!
//! The upstream protocol notes name `$05…` for ACKs and `$1C…`/`$1E…` for
//! answers, but those fragments are hand-transcribed examples, not a
//! byte-offset grammar. Two distinct shapes exist on the wire:
//!
//! - The **state-answer** shape carries *no* function-code byte at all:
//!   `[addr_lo, addr_hi, reserved, state(6 bytes)]`, a fixed 9-byte payload,
//!   used for a spontaneous feedback push *and* as the answer to our own
//!   `0x12`/`0x17` read *and* as the answer mirroring a `0x15`/`0x16`
//!   write's new state. Because the payload is always 9 bytes, `LL` is
//!   always `9*2 + 10 = 28 = 0x1C` for this family — that is where
//!   upstream's "$1C…" notation comes from: it names the frame's **length
//!   field**, not a function code inside the payload. Spec §8 scenario 4's
//!   own worked frame (`"$1C074700FF0000000000CCAEA3"`) decodes to payload
//!   `[0x07, 0x47, 0x00, 0xFF, 0, 0, 0, 0, 0]` — `payload[0] == 0x07` is
//!   the address low byte, not `0x1C`. Dispatch on payload **length**
//!   (9 bytes), never on `payload[0]`.
//! - `0x05` carries two genuine function-code sub-shapes disambiguated by
//!   payload length: a 3-byte `[0x05, addr_lo, addr_hi]` is the write ACK
//!   echo ("echo mode... enabling ACK correlation"); a 4-byte
//!   `[0x05, 0x12|0x17, addr_lo, addr_hi]` is the Feedback Module's own
//!   autonomous refresh/discovery broadcast, which only sets the
//!   "next answer's group" hint and is never itself an answer to anything
//!   we sent.
//!
//! This resolution is recorded in DESIGN.md.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use crate::codec::build_dollar_frame;
use crate::error::{FrameRejectReason, NikobusError, Result};
use crate::transport::TransportWriter;
use crate::types::{Group, ModuleAddress};

pub const FN_READ_GROUP1: u8 = 0x12;
pub const FN_READ_GROUP2: u8 = 0x17;
pub const FN_WRITE_GROUP1: u8 = 0x15;
pub const FN_WRITE_GROUP2: u8 = 0x16;
pub const FN_ACK_OR_REFRESH: u8 = 0x05;

/// Fixed payload length (bytes) of the state-answer shape: `addr_lo`,
/// `addr_hi`, a reserved/unaccounted byte, and 6 state bytes. This family
/// carries no function-code byte, so the Listener dispatches on this
/// length rather than on `payload[0]` — see the module doc above.
pub const ANSWER_PAYLOAD_LEN: usize = 9;

const PACING_DELAY: Duration = Duration::from_millis(300);
const INTER_ACK_DELAY: Duration = Duration::from_millis(75);
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(400);
const DEFAULT_ANSWER_TIMEOUT: Duration = Duration::from_millis(800);
const MAX_ATTEMPTS: u8 = 3;

/// Outcome of a completed command, delivered through its completion slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The ACK arrived and no answer was expected.
    Acked,
    /// The answer frame mirroring the module's state arrived.
    Answered {
        module: ModuleAddress,
        group: Group,
        data: [u8; 6],
    },
}

/// One item in the scheduler's FIFO.
pub struct PendingCommand {
    pub frame: String,
    pub module: ModuleAddress,
    pub expects_ack: bool,
    /// Present for reads and writes alike — both expect a state-answer frame
    /// for this group; `None` only for commands with no state-answer (none in
    /// the current function-code table, kept for forward compatibility).
    pub expects_answer: Option<Group>,
    pub completion: oneshot::Sender<Result<CommandOutcome>>,
}

impl PendingCommand {
    pub fn new_write(
        module: ModuleAddress,
        group: Group,
        new_group_bytes: [u8; 6],
        completion: oneshot::Sender<Result<CommandOutcome>>,
    ) -> Self {
        let mut payload = Vec::with_capacity(10);
        payload.push(group.write_function_code());
        payload.extend_from_slice(&module.to_wire_bytes());
        payload.extend_from_slice(&new_group_bytes);
        payload.push(0xFF); // trailer byte, fixed by the function-code table
        Self {
            frame: build_dollar_frame(&payload),
            module,
            expects_ack: true,
            expects_answer: Some(group),
            completion,
        }
    }

    pub fn new_read(
        module: ModuleAddress,
        group: Group,
        completion: oneshot::Sender<Result<CommandOutcome>>,
    ) -> Self {
        let mut payload = Vec::with_capacity(3);
        payload.push(group.read_function_code());
        payload.extend_from_slice(&module.to_wire_bytes());
        Self {
            frame: build_dollar_frame(&payload),
            module,
            expects_ack: false,
            expects_answer: Some(group),
            completion,
        }
    }
}

/// Handle through which the Listener delivers an observed ACK or answer to
/// whatever command the Scheduler currently has in flight.
///
/// The rule is to keep at most one outstanding refresh per module at a
/// time — the Scheduler already only ever has one command in flight
/// (strict FIFO, one worker), so a single shared slot is sufficient and
/// matches that invariant for free.
#[derive(Default)]
pub struct AwaitingSlot {
    pub module: Option<ModuleAddress>,
    pub ack_tx: Option<oneshot::Sender<()>>,
    pub answer_tx: Option<oneshot::Sender<[u8; 6]>>,
    pub answer_group: Option<Group>,
    /// Fired by the Listener the moment a frame is rejected for a CRC8
    /// mismatch while a command is in flight, short-circuiting the
    /// ACK/answer timeout so retry (spec §4.4) doesn't wait the full
    /// 400ms/800ms for something already known to have failed.
    pub crc_reject_tx: Option<oneshot::Sender<()>>,
}

pub type SharedAwaiting = std::sync::Arc<Mutex<AwaitingSlot>>;

/// Handle used by API-facade callers to enqueue commands.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<PendingCommand>,
}

impl SchedulerHandle {
    pub fn enqueue(&self, cmd: PendingCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| NikobusError::QueueClosed)
    }
}

/// Spawns the scheduler worker loop and returns a handle callers use to
/// enqueue commands, plus the shared awaiting-slot the Listener correlates
/// incoming frames against.
pub fn spawn(writer: TransportWriter) -> (SchedulerHandle, SharedAwaiting, mpsc::UnboundedReceiver<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let awaiting: SharedAwaiting = std::sync::Arc::new(Mutex::new(AwaitingSlot::default()));
    let (lost_tx, lost_rx) = mpsc::unbounded_channel();

    let worker_awaiting = awaiting.clone();
    tokio::spawn(run(rx, writer, worker_awaiting, lost_tx));

    (SchedulerHandle { tx }, awaiting, lost_rx)
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<PendingCommand>,
    mut writer: TransportWriter,
    awaiting: SharedAwaiting,
    lost_tx: mpsc::UnboundedSender<()>,
) {
    info!("scheduler starting");
    while let Some(cmd) = rx.recv().await {
        let result = process(&mut writer, &awaiting, &cmd).await;
        if matches!(result, Err(NikobusError::TransportLost)) {
            let _ = cmd.completion.send(result);
            let _ = lost_tx.send(());
            break;
        }
        let _ = cmd.completion.send(result);
        tokio::time::sleep(PACING_DELAY).await;
    }
    info!("scheduler stopped");
}

async fn process(
    writer: &mut TransportWriter,
    awaiting: &SharedAwaiting,
    cmd: &PendingCommand,
) -> Result<CommandOutcome> {
    let mut attempts_left = MAX_ATTEMPTS;
    loop {
        attempts_left -= 1;
        let (ack_rx, answer_rx, crc_reject_rx) = install_awaiting(awaiting, cmd).await;

        writer.send(&cmd.frame).await?;
        tokio::time::sleep(INTER_ACK_DELAY).await;

        match await_completion(cmd, ack_rx, answer_rx, crc_reject_rx).await {
            Ok(outcome) => {
                clear_awaiting(awaiting).await;
                return Ok(outcome);
            }
            Err(e) => {
                clear_awaiting(awaiting).await;
                if attempts_left == 0 {
                    warn!(module = %cmd.module, error = %e, "retries exhausted");
                    return Err(NikobusError::RetriesExhausted);
                }
                warn!(module = %cmd.module, error = %e, attempts_left, "retrying command");
                tokio::time::sleep(PACING_DELAY).await;
            }
        }
    }
}

async fn install_awaiting(
    awaiting: &SharedAwaiting,
    cmd: &PendingCommand,
) -> (
    Option<oneshot::Receiver<()>>,
    Option<oneshot::Receiver<[u8; 6]>>,
    oneshot::Receiver<()>,
) {
    let mut slot = awaiting.lock().await;
    slot.module = Some(cmd.module);
    slot.answer_group = cmd.expects_answer;

    let ack_rx = if cmd.expects_ack {
        let (tx, rx) = oneshot::channel();
        slot.ack_tx = Some(tx);
        Some(rx)
    } else {
        slot.ack_tx = None;
        None
    };

    let answer_rx = if cmd.expects_answer.is_some() {
        let (tx, rx) = oneshot::channel();
        slot.answer_tx = Some(tx);
        Some(rx)
    } else {
        slot.answer_tx = None;
        None
    };

    let (crc_tx, crc_reject_rx) = oneshot::channel();
    slot.crc_reject_tx = Some(crc_tx);

    (ack_rx, answer_rx, crc_reject_rx)
}

async fn clear_awaiting(awaiting: &SharedAwaiting) {
    let mut slot = awaiting.lock().await;
    *slot = AwaitingSlot::default();
}

async fn await_completion(
    cmd: &PendingCommand,
    ack_rx: Option<oneshot::Receiver<()>>,
    answer_rx: Option<oneshot::Receiver<[u8; 6]>>,
    mut crc_reject_rx: oneshot::Receiver<()>,
) -> Result<CommandOutcome> {
    if cmd.expects_ack {
        let rx = ack_rx.expect("ack channel installed when expects_ack");
        tokio::select! {
            res = tokio::time::timeout(DEFAULT_ACK_TIMEOUT, rx) => {
                res.map_err(|_| NikobusError::AckTimeout(DEFAULT_ACK_TIMEOUT))?
                    .map_err(|_| NikobusError::TransportLost)?;
            }
            _ = &mut crc_reject_rx => {
                return Err(NikobusError::FrameRejected(FrameRejectReason::Crc8Mismatch));
            }
        }
    }

    match cmd.expects_answer {
        Some(group) => {
            let rx = answer_rx.expect("answer channel installed when expects_answer");
            let data = tokio::select! {
                res = tokio::time::timeout(DEFAULT_ANSWER_TIMEOUT, rx) => {
                    res.map_err(|_| NikobusError::AnswerTimeout(DEFAULT_ANSWER_TIMEOUT))?
                        .map_err(|_| NikobusError::TransportLost)?
                }
                _ = &mut crc_reject_rx => {
                    return Err(NikobusError::FrameRejected(FrameRejectReason::Crc8Mismatch));
                }
            };
            Ok(CommandOutcome::Answered {
                module: cmd.module,
                group,
                data,
            })
        }
        None => Ok(CommandOutcome::Acked),
    }
}
