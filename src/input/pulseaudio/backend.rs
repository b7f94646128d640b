use std::fmt;
use std::io;

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw volume of a channel at 100%.
pub const VOLUME_NORM: u32 = 0x10000;

/// Largest volume the sound server accepts, the ceiling for `raise` when
/// volumes past 100% are allowed.
pub const VOLUME_MAX: u32 = u32::MAX / 2;

/// Raw channel volume for a percentage of [`VOLUME_NORM`].
pub fn volume_from_percent(percent: u32) -> u32 {
    (u64::from(percent) * u64::from(VOLUME_NORM) / 100) as u32
}

/// Percentage of [`VOLUME_NORM`], rounded to the nearest integer.
pub fn volume_to_percent(volume: u32) -> u64 {
    let norm = u64::from(VOLUME_NORM);
    (u64::from(volume) * 100 + norm / 2) / norm
}

#[derive(Debug)]
pub enum MixerError {
    /// The helper process could not be started or talked to.
    Spawn(io::Error),
    /// The server answered a request with an error.
    Command { command: String, stderr: String },
    /// The server's answer could not be understood.
    Parse(String),
    /// No connection to the sound server.
    Unreachable(String),
}

impl fmt::Display for MixerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MixerError::Spawn(e) => write!(f, "failed to run mixer client: {e}"),
            MixerError::Command { command, stderr } => write!(f, "'{command}' failed: {stderr}"),
            MixerError::Parse(msg) => write!(f, "unexpected mixer output: {msg}"),
            MixerError::Unreachable(msg) => write!(f, "sound server unreachable: {msg}"),
        }
    }
}

impl std::error::Error for MixerError {}

/// One output device as reported by the sound server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkInfo {
    pub index: u32,
    pub name: String,
    /// Raw volume per channel, in channel-map order.
    pub channels: Vec<u32>,
    pub mute: bool,
    pub active_port: Option<String>,
}

impl SinkInfo {
    pub fn new(index: u32, name: impl Into<String>, channels: Vec<u32>) -> Self {
        Self {
            index,
            name: name.into(),
            channels,
            mute: false,
            active_port: None,
        }
    }
}

/// Sink lifecycle notifications from a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixerEvent {
    New(u32),
    Changed(u32),
    Removed(u32),
}

/// Ends when the server connection goes away.
pub type EventStream = BoxStream<'static, MixerEvent>;

#[async_trait]
pub trait MixerBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, MixerError>;

    /// `Ok(None)` when the sink no longer exists.
    async fn sink(&self, index: u32) -> Result<Option<SinkInfo>, MixerError> {
        let sinks = self.list_sinks().await?;
        Ok(sinks.into_iter().find(|sink| sink.index == index))
    }

    async fn set_sink_volume(&self, index: u32, channels: &[u32]) -> Result<(), MixerError>;

    async fn set_sink_mute(&self, index: u32, mute: bool) -> Result<(), MixerError>;

    async fn subscribe(&self) -> Result<EventStream, MixerError>;
}
