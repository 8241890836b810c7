//! `NikobusEngine`: the outward-facing API facade (turn_on_switch,
//! set_dimmer, open_cover, ...) composed from Transport, Scheduler, State
//! Cache, Cover Estimator, Button FSM, and the event bus.
//!
//! Wiring follows the usual shape for this kind of service: build the
//! transport, spawn the long-running tasks, hand back a handle the caller
//! drives with `tokio::select!`. The reconnect supervisor task is this
//! engine's own addition, since the link can drop and come back without the
//! whole process restarting.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{error, info, warn};

use crate::button::{ButtonHub, ReleaseFollowUp};
use crate::codec::build_button_press_frame;
use crate::config::{Config, ConfigSink};
use crate::cover::CoverEstimator;
use crate::error::{NikobusError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::listener::{FeedbackSink, Listener};
use crate::scheduler::{CommandOutcome, PendingCommand, SchedulerHandle, SharedAwaiting};
use crate::state_cache::StateCache;
use crate::transport::{self, Endpoint};
use crate::types::{ButtonAddress, Group, ModuleAddress, ModuleType};

struct ChannelInfo {
    module_type: ModuleType,
    operation_time_s: u32,
}

pub struct NikobusEngine {
    config: Config,
    cache: Arc<StateCache>,
    events: EventBus,
    scheduler: Arc<RwLock<SchedulerHandle>>,
    awaiting: Arc<RwLock<SharedAwaiting>>,
    cover: Arc<CoverEstimator>,
    buttons: Arc<ButtonHub>,
    channel_info: Arc<HashMap<(ModuleAddress, u8), ChannelInfo>>,
}

impl NikobusEngine {
    /// Open the transport, run the handshake, and spin up the Scheduler
    /// and Listener tasks plus a reconnect supervisor.
    pub async fn connect(config: Config, endpoint: Endpoint) -> Result<Arc<Self>> {
        Self::connect_with_config_sink(config, endpoint, None).await
    }

    /// As [`Self::connect`], but with a [`ConfigSink`] the engine reports
    /// newly observed (unconfigured) button addresses to — the one
    /// persisted-state exception the core allows.
    pub async fn connect_with_config_sink(
        config: Config,
        endpoint: Endpoint,
        config_sink: Option<Arc<dyn ConfigSink>>,
    ) -> Result<Arc<Self>> {
        let (reader, writer) = transport::open(&endpoint).await?;

        let known_modules: Vec<ModuleAddress> = config.modules.iter().map(|m| m.address).collect();
        let cache = Arc::new(StateCache::new(known_modules));
        let events = EventBus::new(256);

        let (scheduler_handle, awaiting, lost_rx) = crate::scheduler::spawn(writer);
        let scheduler = Arc::new(RwLock::new(scheduler_handle));
        let awaiting_cell = Arc::new(RwLock::new(awaiting));

        let cover = Arc::new(CoverEstimator::new());

        let channel_info: HashMap<(ModuleAddress, u8), ChannelInfo> = config
            .modules
            .iter()
            .flat_map(|m| {
                m.channels.iter().enumerate().map(move |(idx, ch)| {
                    (
                        (m.address, (idx + 1) as u8),
                        ChannelInfo {
                            module_type: m.module_type,
                            operation_time_s: ch.operation_time_s(),
                        },
                    )
                })
            })
            .collect();
        let channel_info = Arc::new(channel_info);

        let button_map: HashMap<ButtonAddress, crate::config::ButtonConfig> =
            config.buttons.iter().map(|b| (b.address, b.clone())).collect();

        let feedback_module_present = config.engine.feedback_module_present;
        let refresh_interval_s = config.engine.refresh_interval_s;

        let engine = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let follow_up: Arc<dyn ReleaseFollowUp> = Arc::new(EngineFollowUp { engine: weak.clone() });
            let buttons = ButtonHub::with_config_sink(
                button_map,
                events.sender(),
                config.engine.long_press_threshold_ms,
                config.engine.release_window_ms,
                follow_up,
                config_sink,
            );
            Self {
                config,
                cache: cache.clone(),
                events,
                scheduler: scheduler.clone(),
                awaiting: awaiting_cell.clone(),
                cover: cover.clone(),
                buttons,
                channel_info: channel_info.clone(),
            }
        });

        let feedback_sink: Arc<dyn FeedbackSink> = Arc::new(EngineFeedbackSink {
            cover: cover.clone(),
            channel_info: channel_info.clone(),
        });

        let current_awaiting = awaiting_cell.read().await.clone();
        let listener = Listener::new(
            reader,
            cache.clone(),
            current_awaiting,
            engine.events.sender(),
            engine.buttons.clone(),
            feedback_sink.clone(),
        );
        tokio::spawn(listener.run());

        tokio::spawn(reconnect_supervisor(
            endpoint,
            scheduler,
            awaiting_cell,
            cache,
            engine.events.sender(),
            engine.buttons.clone(),
            feedback_sink,
            lost_rx,
        ));

        if !feedback_module_present {
            tokio::spawn(periodic_refresh_loop(Arc::clone(&engine), refresh_interval_s));
        }

        Ok(engine)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, module: ModuleAddress, channel: u8) -> Result<u8> {
        self.cache.get(module, channel).await
    }

    pub async fn turn_on_switch(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        self.write_channel(module, channel, 0xFF).await
    }

    pub async fn turn_off_switch(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        self.write_channel(module, channel, 0x00).await
    }

    pub async fn set_dimmer(&self, module: ModuleAddress, channel: u8, brightness: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        self.write_channel(module, channel, brightness).await
    }

    pub async fn open_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        let operation_time_s = self.operation_time_s(module, channel);
        self.cover.note_opening(module, channel, operation_time_s).await;
        self.write_channel(module, channel, crate::cover::WIRE_OPEN).await
    }

    pub async fn close_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        let operation_time_s = self.operation_time_s(module, channel);
        self.cover.note_closing(module, channel, operation_time_s).await;
        self.write_channel(module, channel, crate::cover::WIRE_CLOSE).await
    }

    pub async fn stop_cover(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        let operation_time_s = self.operation_time_s(module, channel);
        self.cover.note_stopped(module, channel, operation_time_s).await;
        self.write_channel(module, channel, crate::cover::WIRE_STOP).await
    }

    /// `set_cover_position`: ask the estimator for the direction/duration,
    /// issue the movement command, then schedule the matching stop.
    pub async fn set_cover_position(&self, module: ModuleAddress, channel: u8, target_pct: u8) -> Result<()> {
        self.validate_channel(module, channel)?;
        if target_pct > 100 {
            return Err(NikobusError::InvalidArgument(format!(
                "target position {target_pct} is out of range 0..=100"
            )));
        }
        let operation_time_s = self.operation_time_s(module, channel);
        let cmd = self.cover.set_position(module, channel, target_pct, operation_time_s).await;
        self.write_channel(module, channel, cmd.wire_value).await?;

        if let Some(delay) = cmd.stop_after {
            let scheduler = self.scheduler.clone();
            let cover = self.cover.clone();
            let cache = self.cache.clone();
            let group = Group::for_channel(channel);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                cover.note_stopped(module, channel, operation_time_s).await;
                if cache.apply_write(module, channel, 0x00).await.is_ok() {
                    if let Ok(bytes) = cache.group_bytes(module, group).await {
                        let _ = enqueue_write(&scheduler, module, group, bytes).await;
                    }
                }
            });
        }
        Ok(())
    }

    /// Activate a named scene from config by expanding it into the same
    /// per-module+group coalesced batch write `activate_scene` performs.
    pub async fn activate_scene_by_id(&self, scene_id: &str) -> Result<()> {
        let scene = self
            .config
            .scenes
            .iter()
            .find(|s| s.id == scene_id)
            .ok_or_else(|| NikobusError::InvalidArgument(format!("unknown scene {scene_id}")))?;
        let entries: Vec<(ModuleAddress, u8, u8)> =
            scene.channels.iter().map(|c| (c.module_id, c.channel, c.state)).collect();
        self.activate_scene(&entries).await
    }

    pub async fn refresh_module(&self, module: ModuleAddress) -> Result<()> {
        if !self.config.modules.iter().any(|m| m.address == module) {
            return Err(NikobusError::UnknownModule(module));
        }
        for group in [Group::One, Group::Two] {
            let outcome = self.enqueue_read(module, group).await?;
            if let CommandOutcome::Answered { data, .. } = outcome {
                let _ = self.cache.apply_feedback(module, group, &data).await;
                self.events.sender().send(EngineEvent::Refreshed { module });
            }
        }
        Ok(())
    }

    /// `build_button_press_frame` yields two CR-joined tokens
    /// (`#NAAAAAA` then `#E1`); each is sent as its own scheduler command
    /// with no ACK/answer expectation, since a virtual button press has
    /// no module to correlate a reply against.
    pub async fn press_virtual_button(&self, address: ButtonAddress) -> Result<()> {
        let frame = build_button_press_frame(&address.to_string());
        for token in frame.split('\r').filter(|t| !t.is_empty()) {
            let (tx, _rx) = oneshot::channel();
            let cmd = PendingCommand {
                frame: token.to_string(),
                module: ModuleAddress(0),
                expects_ack: false,
                expects_answer: None,
                completion: tx,
            };
            self.scheduler.read().await.enqueue(cmd)?;
        }
        Ok(())
    }

    /// `activate_scene`: coalesce per module+group into a single batch
    /// write where multiple requested channels share a group.
    pub async fn activate_scene(&self, entries: &[(ModuleAddress, u8, u8)]) -> Result<()> {
        let mut by_group: HashMap<(ModuleAddress, Group), ()> = HashMap::new();
        for &(module, channel, value) in entries {
            self.validate_channel(module, channel)?;
            self.cache.apply_write(module, channel, value).await?;
            by_group.insert((module, Group::for_channel(channel)), ());
        }
        for (module, group) in by_group.keys() {
            let bytes = self.cache.group_bytes(*module, *group).await?;
            let outcome = self.enqueue_write(*module, *group, bytes).await?;
            if let CommandOutcome::Answered { data, .. } = outcome {
                let _ = self.cache.apply_feedback(*module, *group, &data).await;
            }
        }
        Ok(())
    }

    /// Config errors are raised synchronously at enqueue time: an unknown
    /// module or a channel number outside the module's declared
    /// channel list never reaches the cache, whose 1-indexed byte access
    /// would otherwise panic on `channel == 0`.
    fn validate_channel(&self, module: ModuleAddress, channel: u8) -> Result<()> {
        let cfg = self
            .config
            .modules
            .iter()
            .find(|m| m.address == module)
            .ok_or(NikobusError::UnknownModule(module))?;
        if channel == 0 || channel as usize > cfg.channels.len() {
            return Err(NikobusError::InvalidArgument(format!(
                "channel {channel} out of range for module {module} ({} channels)",
                cfg.channels.len()
            )));
        }
        Ok(())
    }

    fn operation_time_s(&self, module: ModuleAddress, channel: u8) -> u32 {
        self.channel_info
            .get(&(module, channel))
            .map(|i| i.operation_time_s)
            .unwrap_or(crate::cover::default_operation_time_s())
    }

    async fn write_channel(&self, module: ModuleAddress, channel: u8, value: u8) -> Result<()> {
        self.cache.apply_write(module, channel, value).await?;
        let group = Group::for_channel(channel);
        let bytes = self.cache.group_bytes(module, group).await?;
        let outcome = self.enqueue_write(module, group, bytes).await?;
        if let CommandOutcome::Answered { data, .. } = outcome {
            let _ = self.cache.apply_feedback(module, group, &data).await;
            self.events.sender().send(EngineEvent::Refreshed { module });
        }
        Ok(())
    }

    async fn enqueue_write(&self, module: ModuleAddress, group: Group, bytes: [u8; 6]) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let cmd = PendingCommand::new_write(module, group, bytes, tx);
        self.scheduler.read().await.enqueue(cmd)?;
        rx.await.map_err(|_| NikobusError::QueueClosed)?
    }

    async fn enqueue_read(&self, module: ModuleAddress, group: Group) -> Result<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let cmd = PendingCommand::new_read(module, group, tx);
        self.scheduler.read().await.enqueue(cmd)?;
        rx.await.map_err(|_| NikobusError::QueueClosed)?
    }
}

async fn enqueue_write(scheduler: &Arc<RwLock<SchedulerHandle>>, module: ModuleAddress, group: Group, bytes: [u8; 6]) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    let cmd = PendingCommand::new_write(module, group, bytes, tx);
    scheduler.read().await.enqueue(cmd)?;
    rx.await.map_err(|_| NikobusError::QueueClosed)??;
    Ok(())
}

struct EngineFeedbackSink {
    cover: Arc<CoverEstimator>,
    channel_info: Arc<HashMap<(ModuleAddress, u8), ChannelInfo>>,
}

impl FeedbackSink for EngineFeedbackSink {
    fn on_feedback(&self, module: ModuleAddress, group: Group, data: [u8; 6]) {
        let base = group.byte_offset() as u8;
        for (i, &byte) in data.iter().enumerate() {
            let channel = base + i as u8 + 1;
            if let Some(info) = self.channel_info.get(&(module, channel)) {
                if info.module_type == ModuleType::Roller && byte == 0x00 {
                    let cover = self.cover.clone();
                    let operation_time_s = info.operation_time_s;
                    tokio::spawn(async move {
                        cover.note_stopped(module, channel, operation_time_s).await;
                    });
                }
            }
        }
    }
}

struct EngineFollowUp {
    engine: std::sync::Weak<NikobusEngine>,
}

impl ReleaseFollowUp for EngineFollowUp {
    fn refresh_impacted(
        &self,
        address: ButtonAddress,
        module: ModuleAddress,
        group: Group,
        operation_time_s: u32,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(engine) = self.engine.upgrade() else { return };
            match engine.enqueue_read(module, group).await {
                Ok(CommandOutcome::Answered { data, .. }) => {
                    let _ = engine.cache.apply_feedback(module, group, &data).await;
                    engine.events.sender().send(EngineEvent::Refreshed { module });
                    engine.events.sender().send(EngineEvent::ButtonOperation {
                        address,
                        module,
                        group,
                        operation_time_s,
                    });
                }
                Ok(CommandOutcome::Acked) => {}
                Err(e) => warn!(address = %address, module = %module, error = %e, "post-release refresh failed"),
            }
        })
    }
}

/// With no Feedback Module on the bus, nothing pushes spontaneous
/// state-answer frames, so the cache only stays fresh if something polls. This
/// loop reads every known module's two groups once per `refresh_interval_s`;
/// it is never spawned when `feedback_module_present` is set.
async fn periodic_refresh_loop(engine: Arc<NikobusEngine>, refresh_interval_s: u64) {
    let interval = std::time::Duration::from_secs(refresh_interval_s.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; skip it, modules were just seeded
    loop {
        ticker.tick().await;
        for module in engine.cache.known_modules().await {
            if let Err(e) = engine.refresh_module(module).await {
                warn!(module = %module, error = %e, "periodic refresh failed");
            }
        }
    }
}

/// Watches the Scheduler's "transport lost" signal, reconnects with
/// backoff, and rebuilds the Scheduler/Listener pair against the fresh
/// link. A full refresh of every known module is kicked off once the new
/// link is up, matching the bus's own reconnect contract.
async fn reconnect_supervisor(
    endpoint: Endpoint,
    scheduler: Arc<RwLock<SchedulerHandle>>,
    awaiting_cell: Arc<RwLock<SharedAwaiting>>,
    cache: Arc<StateCache>,
    events: crate::events::EventSender,
    buttons: Arc<ButtonHub>,
    feedback_sink: Arc<dyn FeedbackSink>,
    mut lost_rx: tokio::sync::mpsc::UnboundedReceiver<()>,
) {
    while lost_rx.recv().await.is_some() {
        warn!("transport lost, reconnecting");
        let (reader, writer) = transport::reconnect(&endpoint).await;
        info!("reconnected, rebuilding scheduler and listener");

        let (new_handle, new_awaiting, new_lost_rx) = crate::scheduler::spawn(writer);
        *scheduler.write().await = new_handle;
        *awaiting_cell.write().await = new_awaiting.clone();
        lost_rx = new_lost_rx;

        let listener = Listener::new(
            reader,
            cache.clone(),
            new_awaiting,
            events.clone(),
            buttons.clone(),
            feedback_sink.clone(),
        );
        tokio::spawn(listener.run());

        for module in cache.known_modules().await {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                for group in [Group::One, Group::Two] {
                    let (tx, _rx) = oneshot::channel();
                    let cmd = PendingCommand::new_read(module, group, tx);
                    let _ = scheduler.read().await.enqueue(cmd);
                }
            });
        }
    }
    error!("reconnect supervisor exiting: lost-signal channel closed");
}
