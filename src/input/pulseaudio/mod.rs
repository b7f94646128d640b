//! # PulseAudio
//!
//! One section per sink, named `("pulseaudio", <sink name>)` and keyed by the
//! sink index. Tokens for the `format` template:
//!
//! | Token    | Type           | Value                                         |
//! |----------|----------------|-----------------------------------------------|
//! | `port`   | `Byte`         | 0 speakers, 1 headphones                      |
//! | `mute`   | `Bool`         | sink is muted                                 |
//! | `volume` | `ListOfUInt64` | percent per channel, one entry if all equal   |
//!
//! ## Connection
//!
//! ```text
//! Disconnected ──► Connecting ──► Ready ──► Terminated
//!                     ▲  │          │
//!                     │  ▼          ▼
//!                     └─ Failed ◄───┘   (retried after RECONNECT_DELAY)
//! ```
//!
//! While the mixer is unreachable every sink shows as unavailable.

mod backend;
mod pactl;
mod scripted;

pub use backend::{
    volume_from_percent, volume_to_percent, EventStream, MixerBackend, MixerError, MixerEvent,
    SinkInfo, VOLUME_MAX, VOLUME_NORM,
};
pub use pactl::PactlBackend;
pub use scripted::{MixerRequest, ScriptedMixer};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info, warn};

use crate::core::action::{ActionError, ActionTable};
use crate::core::config::ResolvedConfig;
use crate::core::format::{self, CompiledTemplate, TypedValue};
use crate::core::plugin::{init_with, InputConstructor, InputPlugin, PluginContext, PluginInitError};
use crate::core::section::{Section, State, StateFlags};

const SECTION_NAME: &str = "pulseaudio";
const DEFAULT_FORMAT: &str = "${volume[@% ]}%";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const TOKENS: &[&str] = &["port", "mute", "volume"];
const TOKEN_PORT: usize = 0;
const TOKEN_MUTE: usize = 1;
const TOKEN_VOLUME: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Raise,
    Lower,
    Set,
    MuteToggle,
    MuteSet,
    MuteUnset,
}

const ACTIONS: &[(&str, Action)] = &[
    ("raise", Action::Raise),
    ("lower", Action::Lower),
    ("set", Action::Set),
    ("mute toggle", Action::MuteToggle),
    ("mute set", Action::MuteSet),
    ("mute unset", Action::MuteUnset),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Disconnected,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl Connection {
    fn allows(self, next: Connection) -> bool {
        use Connection::*;
        match (self, next) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Disconnected | Failed, Connecting) => true,
            (Connecting, Ready) => true,
            (Connecting | Ready, Failed) => true,
            _ => false,
        }
    }
}

/// Results of mixer work spawned by the plugin.
pub enum Message {
    Listed(Result<Vec<SinkInfo>, MixerError>),
    Event(MixerEvent),
    SubscriptionEnded(Option<MixerError>),
    Queried(u32, Result<Option<SinkInfo>, MixerError>),
    Applied(u32, Result<(), MixerError>),
    Reconnect,
}

pub struct PulseAudio {
    backend: Arc<dyn MixerBackend>,
    template: CompiledTemplate,
    actions: ActionTable<Action>,
    /// Raw volume per raise/lower step.
    step: u32,
    /// Raw volume applied by `set`.
    preset: u32,
    ceiling: u32,
    connection: Connection,
    started: bool,
    sinks: HashMap<u32, SinkInfo>,
}

impl PulseAudio {
    /// Builds the plugin on top of `backend` and starts enumerating sinks.
    pub fn with_backend(
        config: &ResolvedConfig,
        backend: Arc<dyn MixerBackend>,
        cx: &mut PluginContext<'_, Message>,
    ) -> Result<Self, PluginInitError> {
        let settings = &config.pulseaudio;
        let template = format::compile(settings.format.as_deref(), TOKENS, DEFAULT_FORMAT)?;
        let actions = ActionTable::build(ACTIONS, &settings.actions);
        info!("PulseAudio plugin using {} backend", backend.name());

        let mut plugin = Self {
            backend,
            template,
            actions,
            step: volume_from_percent(settings.increment),
            preset: volume_from_percent(settings.volume),
            ceiling: if settings.unlimited_volume {
                VOLUME_MAX
            } else {
                VOLUME_NORM
            },
            connection: Connection::Disconnected,
            started: false,
            sinks: HashMap::new(),
        };
        plugin.connect(cx);
        Ok(plugin)
    }

    /// Constructor for a plugin driven by `backend` instead of `pactl`.
    pub fn constructor_with(backend: Arc<dyn MixerBackend>) -> InputConstructor {
        init_with::<Self, _>(move |config, cx| Self::with_backend(config, backend, cx))
    }

    pub fn connection(&self) -> Connection {
        self.connection
    }

    fn transition(&mut self, next: Connection) -> bool {
        if !self.connection.allows(next) {
            debug!("PulseAudio: ignoring {:?} -> {:?}", self.connection, next);
            return false;
        }
        debug!("PulseAudio: {:?} -> {:?}", self.connection, next);
        self.connection = next;
        true
    }

    fn connect(&mut self, cx: &mut PluginContext<'_, Message>) {
        if !self.transition(Connection::Connecting) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        cx.spawn(async move { Message::Listed(backend.list_sinks().await) });
    }

    fn subscribe(&mut self, cx: &mut PluginContext<'_, Message>) {
        let backend = Arc::clone(&self.backend);
        let mailbox = cx.mailbox();
        cx.spawn_worker(async move {
            let mut events = match backend.subscribe().await {
                Ok(events) => events,
                Err(e) => {
                    mailbox.post(Message::SubscriptionEnded(Some(e)));
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if !mailbox.post(Message::Event(event)) {
                    return;
                }
            }
            mailbox.post(Message::SubscriptionEnded(None));
        });
    }

    fn fail(&mut self, cx: &mut PluginContext<'_, Message>) {
        if !self.transition(Connection::Failed) {
            return;
        }
        for &index in self.sinks.keys() {
            if let Some(section) = cx.section_mut(u64::from(index)) {
                section.set_state(State::Unavailable);
            }
        }
        info!("PulseAudio: retrying in {:?}", RECONNECT_DELAY);
        cx.spawn(async {
            tokio::time::sleep(RECONNECT_DELAY).await;
            Message::Reconnect
        });
    }

    fn query(&self, index: u32, cx: &mut PluginContext<'_, Message>) {
        let backend = Arc::clone(&self.backend);
        cx.spawn(async move { Message::Queried(index, backend.sink(index).await) });
    }

    fn render(&self, sink: &SinkInfo) -> String {
        self.template.render(|token| match token {
            TOKEN_PORT => Some(TypedValue::Byte(port_kind(sink.active_port.as_deref()))),
            TOKEN_MUTE => Some(TypedValue::Bool(sink.mute)),
            TOKEN_VOLUME => Some(TypedValue::ListOfUInt64(channel_percentages(&sink.channels))),
            _ => None,
        })
    }

    fn upsert(&mut self, sink: SinkInfo, cx: &mut PluginContext<'_, Message>) {
        let key = u64::from(sink.index);
        let value = self.render(&sink);
        let state = State::Active(if sink.mute {
            StateFlags::BAD
        } else {
            StateFlags::GOOD
        });

        if let Some(section) = cx.section_mut(key) {
            section.set_value(Some(value));
            section.set_state(state);
        } else {
            let mut section = Section::new(SECTION_NAME, sink.name.clone());
            section.set_actionable(true);
            section.set_value(Some(value));
            section.set_state(state);
            if !cx.insert_section(key, section) {
                warn!("PulseAudio: could not register sink '{}'", sink.name);
                return;
            }
            debug!("PulseAudio: added sink #{} '{}'", sink.index, sink.name);
        }
        self.sinks.insert(sink.index, sink);
    }

    fn forget(&mut self, index: u32, cx: &mut PluginContext<'_, Message>) {
        self.sinks.remove(&index);
        if cx.remove_section(u64::from(index)).is_some() {
            debug!("PulseAudio: removed sink #{}", index);
        }
    }
}

impl InputPlugin for PulseAudio {
    type Message = Message;

    const NAME: &'static str = "pulseaudio";

    fn init(
        config: &ResolvedConfig,
        cx: &mut PluginContext<'_, Message>,
    ) -> Result<Self, PluginInitError> {
        Self::with_backend(config, Arc::new(PactlBackend::default()), cx)
    }

    fn start(&mut self, cx: &mut PluginContext<'_, Message>) {
        self.started = true;
        if self.connection == Connection::Ready {
            self.subscribe(cx);
        }
    }

    fn stop(&mut self, _cx: &mut PluginContext<'_, Message>) {
        self.started = false;
    }

    fn uninit(&mut self, _cx: &mut PluginContext<'_, Message>) {
        self.transition(Connection::Terminated);
        self.sinks.clear();
    }

    fn on_message(&mut self, message: Message, cx: &mut PluginContext<'_, Message>) {
        match message {
            Message::Listed(Ok(sinks)) => {
                if !self.transition(Connection::Ready) {
                    return;
                }
                info!("PulseAudio: connected, {} sink(s)", sinks.len());
                let stale: Vec<u32> = self
                    .sinks
                    .keys()
                    .filter(|index| !sinks.iter().any(|s| s.index == **index))
                    .copied()
                    .collect();
                for index in stale {
                    self.forget(index, cx);
                }
                for sink in sinks {
                    self.upsert(sink, cx);
                }
                if self.started {
                    self.subscribe(cx);
                }
            }
            Message::Listed(Err(e)) => {
                warn!("PulseAudio: could not list sinks: {}", e);
                self.fail(cx);
            }
            Message::Event(event) => {
                if self.connection != Connection::Ready {
                    return;
                }
                match event {
                    MixerEvent::New(index) | MixerEvent::Changed(index) => self.query(index, cx),
                    MixerEvent::Removed(index) => self.forget(index, cx),
                }
            }
            Message::SubscriptionEnded(error) => {
                match error {
                    Some(e) => warn!("PulseAudio: subscription failed: {}", e),
                    None => warn!("PulseAudio: connection to the sound server lost"),
                }
                self.fail(cx);
            }
            Message::Queried(_, Ok(Some(sink))) => {
                if self.connection == Connection::Ready {
                    self.upsert(sink, cx);
                }
            }
            Message::Queried(index, Ok(None)) => self.forget(index, cx),
            Message::Queried(index, Err(e)) => {
                warn!("PulseAudio: could not query sink #{}: {}", index, e);
            }
            Message::Applied(index, Ok(())) => self.query(index, cx),
            Message::Applied(index, Err(e)) => {
                warn!(
                    "PulseAudio: sink #{}: {}",
                    index,
                    ActionError::Rejected(e.to_string())
                );
            }
            Message::Reconnect => self.connect(cx),
        }
    }

    fn on_action(&mut self, key: u64, event_id: &str, cx: &mut PluginContext<'_, Message>) {
        let Some(action) = self.actions.lookup(event_id) else {
            debug!("PulseAudio: no action bound to '{}'", event_id);
            return;
        };
        if self.connection != Connection::Ready {
            debug!("PulseAudio: not connected, dropping {:?}", action);
            return;
        }
        let Some(sink) = u32::try_from(key).ok().and_then(|index| self.sinks.get(&index)) else {
            return;
        };
        let index = sink.index;
        let backend = Arc::clone(&self.backend);

        let mute = match action {
            Action::MuteToggle => Some(!sink.mute),
            Action::MuteSet => Some(true),
            Action::MuteUnset => Some(false),
            Action::Raise | Action::Lower | Action::Set => None,
        };
        match mute {
            Some(mute) => cx.spawn(async move {
                Message::Applied(index, backend.set_sink_mute(index, mute).await)
            }),
            None => {
                let channels = adjust_volume(action, &sink.channels, self.step, self.preset, self.ceiling);
                cx.spawn(async move {
                    Message::Applied(index, backend.set_sink_volume(index, &channels).await)
                })
            }
        }
    }
}

fn port_kind(active_port: Option<&str>) -> u8 {
    match active_port {
        Some(port) if port.contains("headphone") => 1,
        _ => 0,
    }
}

/// Channel volumes as percentages, collapsed to one entry when all agree.
fn channel_percentages(channels: &[u32]) -> Vec<u64> {
    let mut percentages: Vec<u64> = channels.iter().map(|&v| volume_to_percent(v)).collect();
    if percentages.windows(2).all(|pair| pair[0] == pair[1]) {
        percentages.truncate(1);
    }
    percentages
}

/// Scales every channel so the loudest one lands on `target`, keeping balance.
fn scale_channels(channels: &[u32], target: u32) -> Vec<u32> {
    let loudest = channels.iter().copied().max().unwrap_or(0);
    if loudest == 0 {
        return vec![target; channels.len()];
    }
    channels
        .iter()
        .map(|&v| (u64::from(v) * u64::from(target) / u64::from(loudest)) as u32)
        .collect()
}

/// New channel volumes for a volume action. `raise` never goes above
/// `ceiling` (nor lowers a volume already past it), `lower` stops at silence,
/// `set` puts every channel at `preset`.
fn adjust_volume(action: Action, channels: &[u32], step: u32, preset: u32, ceiling: u32) -> Vec<u32> {
    let loudest = channels.iter().copied().max().unwrap_or(0);
    match action {
        Action::Raise => {
            let target = if loudest >= ceiling {
                loudest
            } else {
                loudest.saturating_add(step).min(ceiling)
            };
            scale_channels(channels, target)
        }
        Action::Lower => scale_channels(channels, loudest.saturating_sub(step)),
        Action::Set => vec![preset; channels.len()],
        Action::MuteToggle | Action::MuteSet | Action::MuteUnset => channels.to_vec(),
    }
}
