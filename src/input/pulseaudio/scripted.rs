//! An in-process [`MixerBackend`] whose sinks are set up by the caller.
//!
//! A test double: it behaves like a sound server as far as the plugin can
//! tell, and changes made through it or through the control methods below are
//! announced to every subscriber. Nothing outside the test suites selects it.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::backend::{EventStream, MixerBackend, MixerError, MixerEvent, SinkInfo};

/// A change request the backend received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerRequest {
    Volume { index: u32, channels: Vec<u32> },
    Mute { index: u32, mute: bool },
}

#[derive(Default)]
struct Server {
    sinks: BTreeMap<u32, SinkInfo>,
    subscribers: Vec<UnboundedSender<MixerEvent>>,
    requests: Vec<MixerRequest>,
    rejection: Option<String>,
    reachable: bool,
}

impl Server {
    fn announce(&mut self, event: MixerEvent) {
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn check_reachable(&self) -> Result<(), MixerError> {
        if self.reachable {
            Ok(())
        } else {
            Err(MixerError::Unreachable("scripted server is down".into()))
        }
    }
}

/// Cheap to clone; clones share the same sinks.
#[derive(Clone)]
pub struct ScriptedMixer {
    server: Arc<Mutex<Server>>,
}

impl Default for ScriptedMixer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedMixer {
    pub fn new() -> Self {
        Self {
            server: Arc::new(Mutex::new(Server {
                reachable: true,
                ..Server::default()
            })),
        }
    }

    fn server(&self) -> MutexGuard<'_, Server> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_sink(&self, sink: SinkInfo) {
        let mut server = self.server();
        let index = sink.index;
        server.sinks.insert(index, sink);
        server.announce(MixerEvent::New(index));
    }

    /// Changes a sink as if another client did it. `false` if there is no such sink.
    pub fn update_sink(&self, index: u32, update: impl FnOnce(&mut SinkInfo)) -> bool {
        let mut server = self.server();
        let Some(sink) = server.sinks.get_mut(&index) else {
            return false;
        };
        update(sink);
        server.announce(MixerEvent::Changed(index));
        true
    }

    pub fn remove_sink(&self, index: u32) -> Option<SinkInfo> {
        let mut server = self.server();
        let removed = server.sinks.remove(&index)?;
        server.announce(MixerEvent::Removed(index));
        Some(removed)
    }

    pub fn sink(&self, index: u32) -> Option<SinkInfo> {
        self.server().sinks.get(&index).cloned()
    }

    /// Every change request received so far, oldest first.
    pub fn requests(&self) -> Vec<MixerRequest> {
        self.server().requests.clone()
    }

    /// Makes change requests fail with `reason` until called with `None`.
    pub fn reject_requests(&self, reason: Option<&str>) {
        self.server().rejection = reason.map(str::to_string);
    }

    /// Simulates the server going away (ending every subscription) or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        let mut server = self.server();
        server.reachable = reachable;
        if !reachable {
            server.subscribers.clear();
        }
    }

    fn apply(&self, request: MixerRequest) -> Result<(), MixerError> {
        let mut server = self.server();
        server.check_reachable()?;
        server.requests.push(request.clone());
        if let Some(reason) = server.rejection.clone() {
            return Err(MixerError::Command {
                command: format!("{request:?}"),
                stderr: reason,
            });
        }
        let (index, changed) = match request {
            MixerRequest::Volume { index, channels } => {
                let sink = server.sinks.get_mut(&index);
                let found = sink.is_some();
                if let Some(sink) = sink {
                    sink.channels = channels;
                }
                (index, found)
            }
            MixerRequest::Mute { index, mute } => {
                let sink = server.sinks.get_mut(&index);
                let found = sink.is_some();
                if let Some(sink) = sink {
                    sink.mute = mute;
                }
                (index, found)
            }
        };
        if !changed {
            return Err(MixerError::Command {
                command: format!("sink #{index}"),
                stderr: "No such entity".into(),
            });
        }
        server.announce(MixerEvent::Changed(index));
        Ok(())
    }
}

#[async_trait]
impl MixerBackend for ScriptedMixer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, MixerError> {
        let server = self.server();
        server.check_reachable()?;
        Ok(server.sinks.values().cloned().collect())
    }

    async fn sink(&self, index: u32) -> Result<Option<SinkInfo>, MixerError> {
        let server = self.server();
        server.check_reachable()?;
        Ok(server.sinks.get(&index).cloned())
    }

    async fn set_sink_volume(&self, index: u32, channels: &[u32]) -> Result<(), MixerError> {
        self.apply(MixerRequest::Volume {
            index,
            channels: channels.to_vec(),
        })
    }

    async fn set_sink_mute(&self, index: u32, mute: bool) -> Result<(), MixerError> {
        self.apply(MixerRequest::Mute { index, mute })
    }

    async fn subscribe(&self) -> Result<EventStream, MixerError> {
        let mut server = self.server();
        if !server.reachable {
            return Err(MixerError::Spawn(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "scripted server is down",
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        server.subscribers.push(tx);
        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}
