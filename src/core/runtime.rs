//! # Core Loop
//!
//! Owns the plugins, the registry and the channel, and multiplexes the three
//! timelines that touch them on a single task:
//!
//! ```text
//!             ┌──────────── render timer (every `interval`, first at t=0)
//!             │   ┌──────── plugin mailboxes (async completions)
//!             │   │   ┌──── channel read side (host events)
//!             ▼   ▼   ▼
//!          ┌─────────────┐
//!          │ tokio::select│──► tick(): generate_line(snapshot) → write → flush
//!          └─────────────┘──► deliver(): plugin.on_message()
//!                         └──► dispatch(): route() → plugin.on_action()
//! ```
//!
//! Each callback runs to completion before the next one starts, so nothing
//! needs a lock. State changed between two ticks shows up at the next tick.
//!
//! ## Lifecycle
//!
//! `Created → Initializing → Running → Stopping → Terminated`. The output is
//! initialised first and its failure is fatal. Input plugins that fail to
//! initialise are dropped. Teardown runs `stop` then `uninit` per plugin in
//! registration order, then shuts the output down.

use std::future::Future;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::core::action::{self, InboundEvent};
use crate::core::config::ResolvedConfig;
use crate::core::plugin::{
    CoreEvent, DynInputPlugin, InputConstructor, OutputConstructor, OutputPlugin, PluginInitError,
    RawContext,
};
use crate::core::registry::{PluginId, Registry};
use crate::output::channel::{Channel, ReadSide, TransportError};

/// Consecutive write failures after which each new failure is logged as an error.
const TRANSPORT_FAILURE_ESCALATION: u32 = 3;

/// How long one line may take to reach the host before the channel counts as broken.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Initializing,
    Running,
    Stopping,
    Terminated,
}

struct PluginSlot {
    plugin: Box<dyn DynInputPlugin>,
    generation: u64,
    tasks: Vec<AbortHandle>,
    started: bool,
}

impl PluginSlot {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Requests a graceful shutdown from outside the loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: UnboundedSender<CoreEvent>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(CoreEvent::Shutdown);
    }
}

pub struct Core {
    config: ResolvedConfig,
    state: Lifecycle,
    registry: Registry,
    plugins: Vec<PluginSlot>,
    output: Box<dyn OutputPlugin>,
    channel: Box<dyn Channel>,
    tx: UnboundedSender<CoreEvent>,
    rx: UnboundedReceiver<CoreEvent>,
    reader: Option<JoinHandle<()>>,
    next_generation: u64,
    transport_failures: u32,
}

impl Core {
    /// Initialises the output, then every input in order.
    ///
    /// Only an output failure is returned; input failures are logged and the
    /// plugin is left out.
    pub fn initialize(
        config: ResolvedConfig,
        channel: Box<dyn Channel>,
        output: OutputConstructor,
        inputs: Vec<(String, InputConstructor)>,
    ) -> Result<Self, PluginInitError> {
        let mut state = Lifecycle::Created;
        debug!("Core {:?}", state);
        state = Lifecycle::Initializing;
        debug!("Core {:?}", state);

        let output = output(&config)?;
        info!("Output plugin '{}' initialised", output.name());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = Self {
            config,
            state,
            registry: Registry::new(),
            plugins: Vec::new(),
            output,
            channel,
            tx,
            rx,
            reader: None,
            next_generation: 0,
            transport_failures: 0,
        };

        for (name, constructor) in inputs {
            core.init_input(&name, constructor);
        }
        info!(
            "{} input plugin(s) initialised, {} section(s) registered",
            core.plugins.len(),
            core.registry.len()
        );
        Ok(core)
    }

    fn init_input(&mut self, name: &str, constructor: InputConstructor) {
        let id = PluginId(self.plugins.len());
        let generation = self.bump_generation();
        let mut tasks = Vec::new();
        let raw = RawContext {
            plugin: id,
            generation,
            registry: &mut self.registry,
            tx: &self.tx,
            tasks: &mut tasks,
        };
        match constructor(&self.config, raw) {
            Ok(plugin) => {
                info!("Input plugin '{}' initialised", name);
                self.plugins.push(PluginSlot {
                    plugin,
                    generation,
                    tasks,
                    started: false,
                });
            }
            Err(e) => {
                warn!("Input plugin '{}' failed to initialise, skipping: {}", name, e);
                for task in tasks {
                    task.abort();
                }
                self.registry.remove_owned_by(id);
            }
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|slot| slot.plugin.name()).collect()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }

    fn raw_context(&mut self, index: usize) -> Option<(&mut Box<dyn DynInputPlugin>, RawContext<'_>)> {
        let slot = self.plugins.get_mut(index)?;
        let raw = RawContext {
            plugin: PluginId(index),
            generation: slot.generation,
            registry: &mut self.registry,
            tx: &self.tx,
            tasks: &mut slot.tasks,
        };
        Some((&mut slot.plugin, raw))
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Runs until `shutdown` resolves or a [`ShutdownHandle`] fires, then tears down.
    pub async fn run<S>(&mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        self.state = Lifecycle::Running;
        info!("Core running, interval {:?}", self.config.interval);

        self.output.stream_new();
        self.send_header().await;
        self.spawn_reader();

        for index in 0..self.plugins.len() {
            if let Some((plugin, raw)) = self.raw_context(index) {
                plugin.start(raw);
            }
            self.plugins[index].started = true;
        }

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.tick().await,
                Some(event) = self.rx.recv() => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    /// Returns `false` when the loop should stop.
    fn handle_event(&mut self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::Plugin {
                plugin,
                generation,
                message,
            } => self.deliver(plugin, generation, message),
            CoreEvent::Inbound(line) => match self.output.parse_event(&line) {
                Some(event) => self.dispatch(&event),
                None => debug!("Ignoring inbound line: {}", line.trim_end()),
            },
            CoreEvent::InboundClosed => info!("Channel read side closed"),
            CoreEvent::Shutdown => {
                info!("Shutdown requested");
                return false;
            }
        }
        true
    }

    fn deliver(&mut self, id: PluginId, generation: u64, message: Box<dyn std::any::Any + Send>) {
        let current = self.plugins.get(id.0).map(|slot| slot.generation);
        if current != Some(generation) {
            debug!(
                "Dropping stale message for plugin {:?} (generation {} vs {:?})",
                id, generation, current
            );
            return;
        }
        if let Some((plugin, raw)) = self.raw_context(id.0) {
            plugin.deliver(message, raw);
        }
    }

    /// Routes a host event to the plugin owning the target section.
    pub fn dispatch(&mut self, event: &InboundEvent) {
        let Some(handle) = action::route(&self.registry, event) else {
            return;
        };
        debug!(
            "Dispatching '{}' to {}/{}",
            event.event_id, event.name, event.instance
        );
        if let Some((plugin, raw)) = self.raw_context(handle.plugin.0) {
            plugin.action(handle.key, &event.event_id, raw);
        }
    }

    /// Renders the current registry and writes it out. A failed write
    /// triggers a reconnect; the line is not resent.
    pub async fn tick(&mut self) {
        let line = {
            let mut sections = self.registry.snapshot_mut();
            self.output.generate_line(&mut sections)
        };
        let framed = self.output.frame_line(&line);
        match self.write(&framed).await {
            Ok(()) => self.transport_failures = 0,
            Err(e) => {
                self.report_transport_error(&e);
                self.reconnect().await;
            }
        }
    }

    /// Writes and flushes `text`, failing with `Stalled` after [`WRITE_TIMEOUT`].
    async fn write(&mut self, text: &str) -> Result<(), TransportError> {
        let writer = self.channel.write_side();
        let send = async {
            writer
                .write_all(text.as_bytes())
                .await
                .map_err(TransportError::Write)?;
            writer.flush().await.map_err(TransportError::Write)
        };
        tokio::time::timeout(WRITE_TIMEOUT, send)
            .await
            .unwrap_or(Err(TransportError::Stalled(WRITE_TIMEOUT)))
    }

    fn report_transport_error(&mut self, e: &TransportError) {
        self.transport_failures += 1;
        if self.transport_failures >= TRANSPORT_FAILURE_ESCALATION {
            error!(
                "Output channel failing repeatedly ({} in a row): {}",
                self.transport_failures, e
            );
        } else {
            warn!("Output channel error: {}", e);
        }
    }

    async fn send_header(&mut self) {
        let Some(header) = self.output.header() else {
            return;
        };
        if let Err(e) = self.write(&header).await {
            self.report_transport_error(&e);
        }
    }

    /// Re-establishes the channel and readies it for a fresh header/line cycle.
    pub async fn reconnect(&mut self) {
        info!("Reconnecting output channel");
        self.output.stream_free();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Err(e) = self.channel.reconnect().await {
            self.report_transport_error(&e);
            return;
        }
        self.output.stream_new();
        self.send_header().await;
        self.spawn_reader();
    }

    fn spawn_reader(&mut self) {
        let Some(read) = self.channel.read_side() else {
            debug!("Channel has no read side");
            return;
        };
        let tx = self.tx.clone();
        self.reader = Some(tokio::spawn(read_lines(read, tx)));
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    async fn stop(&mut self) {
        self.state = Lifecycle::Stopping;
        info!("Core stopping");

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        for index in 0..self.plugins.len() {
            let name = self.plugins[index].plugin.name();
            let started = self.plugins[index].started;
            // Invalidate mailboxes before anything else can complete
            let generation = self.bump_generation();
            let slot = &mut self.plugins[index];
            slot.abort_tasks();
            let stale_generation = std::mem::replace(&mut slot.generation, generation);
            debug!("Plugin '{}' generation {} retired", name, stale_generation);

            if started && let Some((plugin, raw)) = self.raw_context(index) {
                plugin.stop(raw);
            }
            if let Some((plugin, raw)) = self.raw_context(index) {
                plugin.uninit(raw);
            }
            self.plugins[index].abort_tasks();
            let dropped = self.registry.remove_owned_by(PluginId(index));
            debug!("Plugin '{}' uninitialised, {} section(s) dropped", name, dropped);
        }
        self.plugins.clear();

        self.output.stream_free();
        if let Some(trailer) = self.output.uninit()
            && let Err(e) = self.write(&trailer).await
        {
            warn!("Failed to write output trailer: {}", e);
        }
        self.channel.release().await;

        self.state = Lifecycle::Terminated;
        info!("Core terminated");
    }
}

async fn read_lines(read: ReadSide, tx: UnboundedSender<CoreEvent>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(CoreEvent::Inbound(line)).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("{}", TransportError::Read(e));
                break;
            }
        }
    }
    let _ = tx.send(CoreEvent::InboundClosed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWrite};

    use crate::core::plugin::{constructor, init_with, InputPlugin, PluginContext};
    use crate::core::section::Section;
    use crate::output::channel::MemoryChannel;
    use crate::output::flat::FlatOutput;

    struct Fixed;

    impl InputPlugin for Fixed {
        type Message = ();
        const NAME: &'static str = "fixed";

        fn init(_config: &ResolvedConfig, cx: &mut PluginContext<'_, ()>) -> Result<Self, PluginInitError> {
            let mut section = Section::new("fixed", "0");
            section.set_value(Some("hello".into()));
            cx.insert_section(0, section);
            Ok(Fixed)
        }

        fn on_message(&mut self, _message: (), cx: &mut PluginContext<'_, ()>) {
            if let Some(section) = cx.section_mut(0) {
                section.set_value(Some("poked".into()));
            }
        }
    }

    struct Broken;

    impl InputPlugin for Broken {
        type Message = ();
        const NAME: &'static str = "broken";

        fn init(_config: &ResolvedConfig, cx: &mut PluginContext<'_, ()>) -> Result<Self, PluginInitError> {
            cx.insert_section(0, Section::new("broken", "0"));
            Err(PluginInitError::Unavailable("no device".into()))
        }

        fn on_message(&mut self, _message: (), _cx: &mut PluginContext<'_, ()>) {}
    }

    /// Registers nothing until its first message arrives.
    struct Late;

    impl InputPlugin for Late {
        type Message = ();
        const NAME: &'static str = "late";

        fn init(_config: &ResolvedConfig, _cx: &mut PluginContext<'_, ()>) -> Result<Self, PluginInitError> {
            Ok(Late)
        }

        fn on_message(&mut self, _message: (), cx: &mut PluginContext<'_, ()>) {
            cx.insert_section(0, Section::new("late", "0"));
        }
    }

    static TEARDOWN: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn record(entry: String) {
        TEARDOWN.lock().unwrap().push(entry);
    }

    struct Recorder {
        label: &'static str,
    }

    impl InputPlugin for Recorder {
        type Message = ();
        const NAME: &'static str = "recorder";

        fn init(_config: &ResolvedConfig, _cx: &mut PluginContext<'_, ()>) -> Result<Self, PluginInitError> {
            Ok(Recorder { label: "recorder" })
        }

        fn stop(&mut self, _cx: &mut PluginContext<'_, ()>) {
            record(format!("stop {}", self.label));
        }

        fn uninit(&mut self, cx: &mut PluginContext<'_, ()>) {
            let registered = cx.section(0).is_some();
            record(format!("uninit {} (section registered: {})", self.label, registered));
        }

        fn on_message(&mut self, _message: (), _cx: &mut PluginContext<'_, ()>) {}
    }

    fn recorder(label: &'static str) -> InputConstructor {
        init_with::<Recorder, _>(move |_config, cx| {
            cx.insert_section(0, Section::new("recorder", label));
            Ok(Recorder { label })
        })
    }

    struct RecordingOutput;

    impl OutputPlugin for RecordingOutput {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn generate_line(&mut self, _sections: &mut [&mut Section]) -> String {
            "line".into()
        }

        fn uninit(&mut self) -> Option<String> {
            record("output uninit".into());
            Some("bye\n".into())
        }
    }

    fn recording_output(_config: &ResolvedConfig) -> Result<Box<dyn OutputPlugin>, PluginInitError> {
        Ok(Box::new(RecordingOutput))
    }

    /// A host that never reads: every write stays pending.
    struct StalledWriter;

    impl AsyncWrite for StalledWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    struct StalledChannel {
        writer: StalledWriter,
        reconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Channel for StalledChannel {
        fn read_side(&mut self) -> Option<ReadSide> {
            None
        }

        fn write_side(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
            &mut self.writer
        }

        async fn reconnect(&mut self) -> Result<(), TransportError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&mut self) {}
    }

    fn failing_output(_config: &ResolvedConfig) -> Result<Box<dyn OutputPlugin>, PluginInitError> {
        Err(PluginInitError::Unavailable("no bar".into()))
    }

    #[tokio::test]
    async fn test_output_failure_is_fatal() {
        let (channel, _host) = MemoryChannel::new();
        let result = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            failing_output,
            vec![("fixed".into(), constructor::<Fixed>())],
        );
        assert!(matches!(result, Err(PluginInitError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_failed_input_is_dropped_with_its_sections() {
        let (channel, _host) = MemoryChannel::new();
        let core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![
                ("broken".into(), constructor::<Broken>()),
                ("fixed".into(), constructor::<Fixed>()),
            ],
        )
        .unwrap();
        assert_eq!(core.plugin_names(), ["fixed"]);
        assert_eq!(core.registry().len(), 1);
        assert!(core.registry().find_by_identity("broken", "0").is_none());
        assert_eq!(core.state(), Lifecycle::Initializing);
    }

    #[tokio::test]
    async fn test_dispatch_to_unknown_or_inert_section_is_noop() {
        let (channel, _host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![("fixed".into(), constructor::<Fixed>())],
        )
        .unwrap();
        core.dispatch(&InboundEvent::new("ghost", "0", "mouse:1"));
        core.dispatch(&InboundEvent::new("fixed", "0", "mouse:1"));
        let (_, section) = core.registry().find_by_identity("fixed", "0").unwrap();
        assert_eq!(section.value(), Some("hello"));
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let (channel, _host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![("fixed".into(), constructor::<Fixed>())],
        )
        .unwrap();
        let current = core.plugins[0].generation;

        core.deliver(PluginId(0), current + 1, Box::new(()));
        core.deliver(PluginId(7), current, Box::new(()));
        let (_, section) = core.registry().find_by_identity("fixed", "0").unwrap();
        assert_eq!(section.value(), Some("hello"));

        core.deliver(PluginId(0), current, Box::new(()));
        let (_, section) = core.registry().find_by_identity("fixed", "0").unwrap();
        assert_eq!(section.value(), Some("poked"));
    }

    #[tokio::test]
    async fn test_late_section_keeps_plugin_position() {
        let (channel, _host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![
                ("late".into(), constructor::<Late>()),
                ("fixed".into(), constructor::<Fixed>()),
            ],
        )
        .unwrap();
        assert_eq!(core.registry().len(), 1);

        let generation = core.plugins[0].generation;
        core.deliver(PluginId(0), generation, Box::new(()));
        let names: Vec<&str> = core.registry().snapshot().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["late", "fixed"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_runs_in_registration_order_then_output() {
        let (channel, mut host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            recording_output,
            vec![
                ("first".into(), recorder("first")),
                ("second".into(), recorder("second")),
            ],
        )
        .unwrap();
        core.run(tokio::time::sleep(Duration::from_millis(10))).await;

        assert_eq!(
            *TEARDOWN.lock().unwrap(),
            [
                "stop first",
                "uninit first (section registered: true)",
                "stop second",
                "uninit second (section registered: true)",
                "output uninit",
            ]
        );
        let mut written = String::new();
        host.accept()
            .await
            .unwrap()
            .lines
            .read_to_string(&mut written)
            .await
            .unwrap();
        assert_eq!(written, "line\nbye\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_host_does_not_block_shutdown() {
        let reconnects = Arc::new(AtomicUsize::new(0));
        let channel = StalledChannel {
            writer: StalledWriter,
            reconnects: reconnects.clone(),
        };
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![("fixed".into(), constructor::<Fixed>())],
        )
        .unwrap();
        let start = tokio::time::Instant::now();
        core.run(tokio::time::sleep(Duration::from_millis(10))).await;

        assert_eq!(core.state(), Lifecycle::Terminated);
        assert_eq!(reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), WRITE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_terminates_and_clears_registry() {
        let (channel, _host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            vec![("fixed".into(), constructor::<Fixed>())],
        )
        .unwrap();
        core.run(tokio::time::sleep(Duration::from_millis(10))).await;
        assert_eq!(core.state(), Lifecycle::Terminated);
        assert!(core.registry().is_empty());
        assert!(core.plugin_names().is_empty());
    }

    #[tokio::test]
    async fn test_reader_forwards_lines_then_closes() {
        let mock = tokio_test::io::Builder::new()
            .read(b"pulseaudio sink0 mouse:1\n")
            .read(b"second line\n")
            .build();
        let (tx, mut rx) = mpsc::unbounded_channel();
        read_lines(Box::new(mock), tx).await;

        assert!(matches!(rx.recv().await, Some(CoreEvent::Inbound(l)) if l == "pulseaudio sink0 mouse:1"));
        assert!(matches!(rx.recv().await, Some(CoreEvent::Inbound(l)) if l == "second line"));
        assert!(matches!(rx.recv().await, Some(CoreEvent::InboundClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_handle_stops_loop() {
        let (channel, _host) = MemoryChannel::new();
        let mut core = Core::initialize(
            ResolvedConfig::default(),
            Box::new(channel),
            FlatOutput::init,
            Vec::new(),
        )
        .unwrap();
        core.shutdown_handle().shutdown();
        core.run(std::future::pending::<()>()).await;
        assert_eq!(core.state(), Lifecycle::Terminated);
    }
}
