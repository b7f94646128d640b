//! [`MixerBackend`] on top of the `pactl` command-line client.
//!
//! Queries go through `pactl -f json`, changes through `set-sink-*`, and
//! notifications come from a long-running `pactl subscribe` whose lines look
//! like `Event 'change' on sink #0`.

use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::backend::{EventStream, MixerBackend, MixerError, MixerEvent, SinkInfo};

const DEFAULT_PROGRAM: &str = "pactl";

// ============================================================================
// pactl JSON
// ============================================================================

#[derive(Deserialize, Debug)]
struct PactlChannelVolume {
    value: u32,
}

#[derive(Deserialize, Debug)]
struct PactlSink {
    index: u32,
    name: String,
    mute: bool,
    #[serde(default)]
    channel_map: String,
    volume: BTreeMap<String, PactlChannelVolume>,
    #[serde(default)]
    active_port: Option<String>,
}

impl From<PactlSink> for SinkInfo {
    fn from(sink: PactlSink) -> Self {
        // JSON objects lose their key order; the channel map has it
        let mut channels: Vec<u32> = sink
            .channel_map
            .split(',')
            .filter_map(|position| sink.volume.get(position.trim()))
            .map(|v| v.value)
            .collect();
        if channels.len() != sink.volume.len() {
            channels = sink.volume.values().map(|v| v.value).collect();
        }
        SinkInfo {
            index: sink.index,
            name: sink.name,
            channels,
            mute: sink.mute,
            active_port: sink.active_port,
        }
    }
}

fn parse_sinks(json: &[u8]) -> Result<Vec<SinkInfo>, MixerError> {
    let sinks: Vec<PactlSink> =
        serde_json::from_slice(json).map_err(|e| MixerError::Parse(e.to_string()))?;
    Ok(sinks.into_iter().map(SinkInfo::from).collect())
}

/// Parses one `pactl subscribe` line. Anything that is not about a sink is `None`.
fn parse_subscribe_line(line: &str) -> Option<MixerEvent> {
    let rest = line.trim().strip_prefix("Event '")?;
    let (kind, facility) = rest.split_once("' on ")?;
    let index = facility.strip_prefix("sink #")?.parse().ok()?;
    match kind {
        "new" => Some(MixerEvent::New(index)),
        "change" => Some(MixerEvent::Changed(index)),
        "remove" => Some(MixerEvent::Removed(index)),
        _ => None,
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct PactlBackend {
    program: String,
}

impl PactlBackend {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, MixerError> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(MixerError::Spawn)?;
        if !output.status.success() {
            return Err(MixerError::Command {
                command: format!("{} {}", self.program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl Default for PactlBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

#[async_trait]
impl MixerBackend for PactlBackend {
    fn name(&self) -> &str {
        &self.program
    }

    async fn list_sinks(&self) -> Result<Vec<SinkInfo>, MixerError> {
        let json = self.run(&["-f", "json", "list", "sinks"]).await?;
        parse_sinks(&json)
    }

    async fn set_sink_volume(&self, index: u32, channels: &[u32]) -> Result<(), MixerError> {
        let index = index.to_string();
        let volumes: Vec<String> = channels.iter().map(u32::to_string).collect();
        let mut args = vec!["set-sink-volume", index.as_str()];
        args.extend(volumes.iter().map(String::as_str));
        self.run(&args).await.map(drop)
    }

    async fn set_sink_mute(&self, index: u32, mute: bool) -> Result<(), MixerError> {
        let index = index.to_string();
        let mute = if mute { "1" } else { "0" };
        self.run(&["set-sink-mute", index.as_str(), mute]).await.map(drop)
    }

    async fn subscribe(&self) -> Result<EventStream, MixerError> {
        let mut child = Command::new(&self.program)
            .arg("subscribe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(MixerError::Spawn)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MixerError::Unreachable("subscribe has no stdout".into()))?;
        let lines = BufReader::new(stdout).lines();

        // The child rides along in the stream state so dropping the stream kills it
        let events = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = parse_subscribe_line(&line) {
                            return Some((event, (child, lines)));
                        }
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        warn!("pactl subscribe: {}", e);
                        return None;
                    }
                }
            }
        });
        Ok(events.boxed())
    }
}
