//! # Plugin Contracts
//!
//! Two kinds of plugins talk to the core:
//!
//! - **Input plugins** own sections. They create them during `init`, may add
//!   or remove more after `start`, and are the only writers of their sections.
//! - **Output plugins** turn the registry into lines for the channel and parse
//!   inbound events coming back from the status-bar host.
//!
//! ## Asynchronous work
//!
//! Plugin code only ever runs on the core loop. Anything slow is spawned on
//! the runtime with [`PluginContext::spawn`], and its result comes back as a
//! typed message through the plugin's [`Mailbox`]:
//!
//! ```text
//!   plugin.on_action()  ──spawn──►  tokio task  ──post──►  core loop
//!          ▲                                                   │
//!          └──────────────── plugin.on_message() ◄─────────────┘
//! ```
//!
//! Every mailbox is stamped with the plugin's generation. Once a plugin is
//! stopped its generation changes, so late completions are dropped instead of
//! reaching a plugin that has already torn down.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;

use crate::core::action::InboundEvent;
use crate::core::config::ResolvedConfig;
use crate::core::format::CompileError;
use crate::core::registry::{PluginId, Registry, SectionHandle};
use crate::core::section::Section;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum PluginInitError {
    /// No plugin registered under this name.
    UnknownPlugin(String),
    /// The backing device or service is missing.
    Unavailable(String),
    /// The plugin's format template does not compile.
    Compile(CompileError),
    Io(std::io::Error),
}

impl fmt::Display for PluginInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginInitError::UnknownPlugin(name) => write!(f, "no plugin named '{name}'"),
            PluginInitError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            PluginInitError::Compile(e) => write!(f, "format error: {e}"),
            PluginInitError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PluginInitError {}

impl From<CompileError> for PluginInitError {
    fn from(e: CompileError) -> Self {
        PluginInitError::Compile(e)
    }
}

impl From<std::io::Error> for PluginInitError {
    fn from(e: std::io::Error) -> Self {
        PluginInitError::Io(e)
    }
}

// ============================================================================
// Core events & mailboxes
// ============================================================================

/// Everything that wakes the core loop besides the render timer.
pub enum CoreEvent {
    Plugin {
        plugin: PluginId,
        generation: u64,
        message: Box<dyn Any + Send>,
    },
    /// A raw line from the channel's read side.
    Inbound(String),
    /// The read side reached EOF or failed.
    InboundClosed,
    Shutdown,
}

impl fmt::Debug for CoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreEvent::Plugin { plugin, generation, .. } => f
                .debug_struct("Plugin")
                .field("plugin", plugin)
                .field("generation", generation)
                .finish_non_exhaustive(),
            CoreEvent::Inbound(line) => f.debug_tuple("Inbound").field(line).finish(),
            CoreEvent::InboundClosed => f.write_str("InboundClosed"),
            CoreEvent::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Sends typed messages back to the plugin that owns it, on the core loop.
pub struct Mailbox<M> {
    plugin: PluginId,
    generation: u64,
    tx: UnboundedSender<CoreEvent>,
    _message: PhantomData<fn(M)>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            plugin: self.plugin,
            generation: self.generation,
            tx: self.tx.clone(),
            _message: PhantomData,
        }
    }
}

impl<M: Send + 'static> Mailbox<M> {
    /// Returns `false` once the core loop is gone.
    pub fn post(&self, message: M) -> bool {
        self.tx
            .send(CoreEvent::Plugin {
                plugin: self.plugin,
                generation: self.generation,
                message: Box::new(message),
            })
            .is_ok()
    }
}

// ============================================================================
// Plugin context
// ============================================================================

/// The untyped pieces of core state a plugin callback may touch.
pub struct RawContext<'a> {
    pub(crate) plugin: PluginId,
    pub(crate) generation: u64,
    pub(crate) registry: &'a mut Registry,
    pub(crate) tx: &'a UnboundedSender<CoreEvent>,
    pub(crate) tasks: &'a mut Vec<AbortHandle>,
}

impl<'a> RawContext<'a> {
    pub(crate) fn typed<M>(self) -> PluginContext<'a, M> {
        PluginContext { raw: self, _message: PhantomData }
    }
}

/// What an input plugin sees during a callback: its own sections and a way
/// to schedule work whose result comes back as `M`.
pub struct PluginContext<'a, M> {
    raw: RawContext<'a>,
    _message: PhantomData<fn(M)>,
}

impl<M: Send + 'static> PluginContext<'_, M> {
    pub fn plugin_id(&self) -> PluginId {
        self.raw.plugin
    }

    fn handle(&self, key: u64) -> SectionHandle {
        SectionHandle::new(self.raw.plugin, key)
    }

    /// Registers a section under a plugin-chosen key. `false` if the key or
    /// the section's `(name, instance)` is already taken.
    pub fn insert_section(&mut self, key: u64, section: Section) -> bool {
        let handle = self.handle(key);
        self.raw.registry.insert(handle, section)
    }

    pub fn section(&self, key: u64) -> Option<&Section> {
        self.raw.registry.find(self.handle(key))
    }

    pub fn section_mut(&mut self, key: u64) -> Option<&mut Section> {
        let handle = self.handle(key);
        self.raw.registry.find_mut(handle)
    }

    pub fn remove_section(&mut self, key: u64) -> Option<Section> {
        let handle = self.handle(key);
        self.raw.registry.remove(handle)
    }

    pub fn mailbox(&self) -> Mailbox<M> {
        Mailbox {
            plugin: self.raw.plugin,
            generation: self.raw.generation,
            tx: self.raw.tx.clone(),
            _message: PhantomData,
        }
    }

    /// Runs `future` on the runtime and delivers its output to `on_message`.
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = M> + Send + 'static,
    {
        let mailbox = self.mailbox();
        self.spawn_worker(async move {
            let message = future.await;
            if !mailbox.post(message) {
                debug!("Dropping plugin result: core loop is gone");
            }
        });
    }

    /// Runs a long-lived task (a subscription, a poller) that posts through
    /// a mailbox obtained beforehand. Aborted when the plugin stops.
    pub fn spawn_worker<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.raw.tasks.retain(|task| !task.is_finished());
        let handle = tokio::spawn(future);
        self.raw.tasks.push(handle.abort_handle());
    }
}

// ============================================================================
// Input plugins
// ============================================================================

pub trait InputPlugin: Sized + 'static {
    /// Results of this plugin's spawned work.
    type Message: Send + 'static;

    const NAME: &'static str;

    /// Enumerates existing sources and registers their sections.
    fn init(
        config: &ResolvedConfig,
        cx: &mut PluginContext<'_, Self::Message>,
    ) -> Result<Self, PluginInitError>;

    /// Begins emitting asynchronous updates (subscriptions, pollers).
    fn start(&mut self, _cx: &mut PluginContext<'_, Self::Message>) {}

    fn stop(&mut self, _cx: &mut PluginContext<'_, Self::Message>) {}

    /// Releases plugin resources. Remaining sections are dropped by the core.
    fn uninit(&mut self, _cx: &mut PluginContext<'_, Self::Message>) {}

    fn on_message(&mut self, message: Self::Message, cx: &mut PluginContext<'_, Self::Message>);

    /// A host event targeted one of this plugin's actionable sections.
    fn on_action(&mut self, _key: u64, _event_id: &str, _cx: &mut PluginContext<'_, Self::Message>) {
    }
}

/// Object-safe face of [`InputPlugin`] used by the core.
pub trait DynInputPlugin {
    fn name(&self) -> &'static str;
    fn start(&mut self, raw: RawContext<'_>);
    fn stop(&mut self, raw: RawContext<'_>);
    fn uninit(&mut self, raw: RawContext<'_>);
    fn deliver(&mut self, message: Box<dyn Any + Send>, raw: RawContext<'_>);
    fn action(&mut self, key: u64, event_id: &str, raw: RawContext<'_>);
}

impl<P: InputPlugin> DynInputPlugin for P {
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn start(&mut self, raw: RawContext<'_>) {
        InputPlugin::start(self, &mut raw.typed());
    }

    fn stop(&mut self, raw: RawContext<'_>) {
        InputPlugin::stop(self, &mut raw.typed());
    }

    fn uninit(&mut self, raw: RawContext<'_>) {
        InputPlugin::uninit(self, &mut raw.typed());
    }

    fn deliver(&mut self, message: Box<dyn Any + Send>, raw: RawContext<'_>) {
        match message.downcast::<P::Message>() {
            Ok(message) => self.on_message(*message, &mut raw.typed()),
            Err(_) => warn!("{}: dropping message of unexpected type", P::NAME),
        }
    }

    fn action(&mut self, key: u64, event_id: &str, raw: RawContext<'_>) {
        self.on_action(key, event_id, &mut raw.typed());
    }
}

/// Builds an input plugin, see [`crate::input::lookup`].
pub type InputConstructor = Box<
    dyn FnOnce(&ResolvedConfig, RawContext<'_>) -> Result<Box<dyn DynInputPlugin>, PluginInitError>,
>;

/// The [`InputConstructor`] for a plugin built by its own [`InputPlugin::init`].
pub fn constructor<P: InputPlugin>() -> InputConstructor {
    init_with(P::init)
}

/// An [`InputConstructor`] running custom initialisation, e.g. to hand a
/// plugin a particular backend.
pub fn init_with<P, F>(init: F) -> InputConstructor
where
    P: InputPlugin,
    F: FnOnce(&ResolvedConfig, &mut PluginContext<'_, P::Message>) -> Result<P, PluginInitError>
        + 'static,
{
    Box::new(move |config: &ResolvedConfig, raw: RawContext<'_>| {
        let plugin = init(config, &mut raw.typed())?;
        Ok(Box::new(plugin) as Box<dyn DynInputPlugin>)
    })
}

// ============================================================================
// Output plugins
// ============================================================================

/// Serializes sections for a status-bar host and decodes what it sends back.
///
/// The core owns the channel: methods return text and the core writes it.
pub trait OutputPlugin {
    fn name(&self) -> &'static str;

    /// A fresh stream was (re)connected. Reset any per-stream framing.
    fn stream_new(&mut self) {}

    /// The current stream is going away.
    fn stream_free(&mut self) {}

    /// Protocol preamble, written once per stream before the first line.
    fn header(&mut self) -> Option<String> {
        None
    }

    /// Renders one status line. Outputs may use the section caches.
    fn generate_line(&mut self, sections: &mut [&mut Section]) -> String;

    /// Wraps a generated line for the wire (separators, newline).
    fn frame_line(&mut self, line: &str) -> String {
        format!("{line}\n")
    }

    /// Decodes one inbound line into an action event.
    fn parse_event(&self, _line: &str) -> Option<InboundEvent> {
        None
    }

    /// Protocol epilogue written at shutdown.
    fn uninit(&mut self) -> Option<String> {
        None
    }
}

pub type OutputConstructor = fn(&ResolvedConfig) -> Result<Box<dyn OutputPlugin>, PluginInitError>;
