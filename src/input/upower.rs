//! # Power Supplies
//!
//! Batteries (and with `all_devices`, UPSes and peripherals such as wireless
//! mice) read from the kernel's power-supply class:
//!
//! ```text
//! /sys/class/power_supply/
//! ├── AC/      type=Mains              skipped
//! ├── BAT0/    type=Battery            upower-battery/BAT0
//! └── hidpp_battery_0/
//!              type=Battery scope=Device   upower-device/hidpp_battery_0
//! ```
//!
//! The directory is rescanned every `poll_interval` on a blocking thread, so
//! hot-plugged devices come and go without a restart.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::config::ResolvedConfig;
use crate::core::plugin::{InputPlugin, PluginContext, PluginInitError};
use crate::core::section::{Section, State, StateFlags};

/// Widest value a device can show.
const SAMPLE_VALUE: &str = "Chr 100.00% (00:00:00)";
const LOW_PERCENT: f64 = 15.0;
const CRITICAL_PERCENT: f64 = 5.0;
const NO_BATTERY: &str = "No battery";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Battery,
    Ups,
    Peripheral,
}

impl DeviceKind {
    fn section_name(self) -> &'static str {
        match self {
            DeviceKind::Battery => "upower-battery",
            DeviceKind::Ups => "upower-ups",
            DeviceKind::Peripheral => "upower-device",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    Unknown,
    Charging,
    Discharging,
    /// Plugged in but not charging, usually held below a charge threshold.
    PendingCharge,
    Empty,
    Full,
}

impl Charge {
    fn from_status(status: &str) -> Self {
        match status {
            "Charging" => Charge::Charging,
            "Discharging" => Charge::Discharging,
            "Not charging" => Charge::PendingCharge,
            "Full" => Charge::Full,
            "Empty" => Charge::Empty,
            _ => Charge::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub charge: Charge,
    pub percentage: Option<f64>,
    /// Time to empty while discharging, time to full while charging.
    pub seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    /// Directory name under the power-supply root, e.g. `BAT0`.
    pub id: String,
    pub kind: DeviceKind,
    pub model: Option<String>,
    pub reading: Reading,
}

// ============================================================================
// sysfs
// ============================================================================

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    let value = fs::read_to_string(dir.join(name)).ok()?;
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn read_number(dir: &Path, name: &str) -> Option<f64> {
    read_attr(dir, name)?.parse().ok()
}

/// `now / full` from whichever unit the driver reports, energy (µWh) or charge (µAh).
fn capacity_pair(dir: &Path) -> Option<(f64, f64, Option<f64>)> {
    let pick = |now: &str, full: &str, rate: &str| {
        let now = read_number(dir, now)?;
        let full = read_number(dir, full)?;
        Some((now, full, read_number(dir, rate).filter(|r| *r > 0.0)))
    };
    pick("energy_now", "energy_full", "power_now").or_else(|| pick("charge_now", "charge_full", "current_now"))
}

fn read_device(dir: &Path) -> Reading {
    if read_attr(dir, "present").as_deref() == Some("0") {
        return Reading {
            charge: Charge::Unknown,
            percentage: None,
            seconds: None,
        };
    }
    let charge = read_attr(dir, "status")
        .map(|status| Charge::from_status(&status))
        .unwrap_or(Charge::Unknown);
    let pair = capacity_pair(dir);

    let percentage = read_number(dir, "capacity").or_else(|| {
        let (now, full, _) = pair?;
        (full > 0.0).then(|| (now / full * 100.0).min(100.0))
    });

    let seconds = pair.and_then(|(now, full, rate)| {
        let rate = rate?;
        let remaining = match charge {
            Charge::Discharging => now,
            Charge::Charging => (full - now).max(0.0),
            _ => return None,
        };
        Some((remaining * 3600.0 / rate) as u64)
    });

    Reading {
        charge,
        percentage,
        seconds,
    }
}

fn classify(dir: &Path) -> Option<DeviceKind> {
    match read_attr(dir, "type")?.as_str() {
        "Battery" if read_attr(dir, "scope").as_deref() == Some("Device") => {
            Some(DeviceKind::Peripheral)
        }
        "Battery" => Some(DeviceKind::Battery),
        "UPS" => Some(DeviceKind::Ups),
        _ => None,
    }
}

/// Lists the devices under `root`, sorted by directory name. Only system
/// batteries unless `all_devices`.
pub fn scan(root: &Path, all_devices: bool) -> io::Result<Vec<Device>> {
    let mut devices = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let dir = entry.path();
        let Some(kind) = classify(&dir) else {
            continue;
        };
        if kind != DeviceKind::Battery && !all_devices {
            continue;
        }
        devices.push(Device {
            id: entry.file_name().to_string_lossy().into_owned(),
            kind,
            model: read_attr(&dir, "model_name"),
            reading: read_device(&dir),
        });
    }
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(devices)
}

// ============================================================================
// Presentation
// ============================================================================

fn format_duration(seconds: u64) -> String {
    let (h, rest) = (seconds / 3600, seconds % 3600);
    let (m, s) = (rest / 60, rest % 60);
    format!("{h:02}:{m:02}:{s:02}")
}

/// The section value and state for a reading.
pub fn present(reading: &Reading) -> (String, State) {
    let percentage = reading.percentage.unwrap_or(-1.0);
    let (status, flags) = match reading.charge {
        Charge::Unknown => return (NO_BATTERY.to_string(), State::Unavailable),
        Charge::Charging | Charge::PendingCharge => ("Chr", StateFlags::AVERAGE),
        Charge::Discharging => {
            let mut flags = if percentage >= 0.0 && percentage < LOW_PERCENT {
                StateFlags::BAD
            } else {
                StateFlags::AVERAGE
            };
            if percentage >= 0.0 && percentage < CRITICAL_PERCENT {
                flags |= StateFlags::URGENT;
            }
            ("Bat", flags)
        }
        Charge::Empty => ("Empty", StateFlags::BAD | StateFlags::URGENT),
        Charge::Full => ("Full", StateFlags::GOOD),
    };

    let value = match (reading.percentage, reading.seconds) {
        (None, _) => status.to_string(),
        (Some(pct), Some(secs)) if secs >= 1 => {
            format!("{status} {pct:.2}% ({})", format_duration(secs))
        }
        (Some(pct), _) => format!("{status} {pct:.2}%"),
    };
    (value, State::Active(flags))
}

// ============================================================================
// Plugin
// ============================================================================

pub enum Message {
    Scanned(io::Result<Vec<Device>>),
}

pub struct Upower {
    root: PathBuf,
    all_devices: bool,
    poll_interval: Duration,
    keys: HashMap<String, u64>,
    next_key: u64,
}

impl Upower {
    fn apply(&mut self, devices: Vec<Device>, cx: &mut PluginContext<'_, Message>) {
        let mut seen = HashSet::with_capacity(devices.len());
        for device in devices {
            let key = match self.keys.get(&device.id) {
                Some(&key) => key,
                None => match self.add_section(&device, cx) {
                    Some(key) => key,
                    None => continue,
                },
            };
            seen.insert(key);
            let (value, state) = present(&device.reading);
            if let Some(section) = cx.section_mut(key) {
                section.set_value(Some(value));
                section.set_state(state);
            }
        }

        let gone: Vec<String> = self
            .keys
            .iter()
            .filter(|(_, key)| !seen.contains(*key))
            .map(|(id, _)| id.clone())
            .collect();
        for id in gone {
            if let Some(key) = self.keys.remove(&id) {
                cx.remove_section(key);
                info!("Power supply '{}' went away", id);
            }
        }
    }

    fn add_section(&mut self, device: &Device, cx: &mut PluginContext<'_, Message>) -> Option<u64> {
        let mut section = Section::new(device.kind.section_name(), device.id.clone());
        if device.kind == DeviceKind::Peripheral
            && let Some(model) = &device.model
        {
            section.set_label(model.clone());
        }
        section.set_max_width_sample(SAMPLE_VALUE);

        let key = self.next_key;
        if !cx.insert_section(key, section) {
            warn!("Could not register power supply '{}'", device.id);
            return None;
        }
        self.next_key += 1;
        self.keys.insert(device.id.clone(), key);
        debug!("Tracking power supply '{}' as {:?}", device.id, device.kind);
        Some(key)
    }
}

impl InputPlugin for Upower {
    type Message = Message;

    const NAME: &'static str = "upower";

    fn init(
        config: &ResolvedConfig,
        cx: &mut PluginContext<'_, Message>,
    ) -> Result<Self, PluginInitError> {
        let settings = &config.upower;
        let devices = scan(&settings.sysfs_root, settings.all_devices).map_err(|e| {
            PluginInitError::Unavailable(format!("{}: {}", settings.sysfs_root.display(), e))
        })?;
        if devices.is_empty() {
            return Err(PluginInitError::Unavailable(format!(
                "no battery under {}",
                settings.sysfs_root.display()
            )));
        }

        let mut plugin = Self {
            root: settings.sysfs_root.clone(),
            all_devices: settings.all_devices,
            poll_interval: settings.poll_interval,
            keys: HashMap::new(),
            next_key: 0,
        };
        plugin.apply(devices, cx);
        Ok(plugin)
    }

    fn start(&mut self, cx: &mut PluginContext<'_, Message>) {
        let root = self.root.clone();
        let all_devices = self.all_devices;
        let poll_interval = self.poll_interval;
        let mailbox = cx.mailbox();
        cx.spawn_worker(async move {
            loop {
                tokio::time::sleep(poll_interval).await;
                let root = root.clone();
                let scanned = tokio::task::spawn_blocking(move || scan(&root, all_devices))
                    .await
                    .unwrap_or_else(|e| Err(io::Error::other(e)));
                if !mailbox.post(Message::Scanned(scanned)) {
                    return;
                }
            }
        });
    }

    fn on_message(&mut self, message: Message, cx: &mut PluginContext<'_, Message>) {
        match message {
            Message::Scanned(Ok(devices)) => self.apply(devices, cx),
            Message::Scanned(Err(e)) => {
                warn!("Failed to read {}: {}", self.root.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::DynInputPlugin;
    use crate::test_support::PluginHarness;
    use tempfile::TempDir;

    fn write_device(root: &Path, id: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        for (name, value) in attrs {
            fs::write(dir.join(name), format!("{value}\n")).unwrap();
        }
    }

    fn laptop() -> TempDir {
        let root = TempDir::new().unwrap();
        write_device(root.path(), "AC", &[("type", "Mains"), ("online", "0")]);
        write_device(
            root.path(),
            "BAT0",
            &[
                ("type", "Battery"),
                ("status", "Discharging"),
                ("present", "1"),
                ("capacity", "42"),
                ("energy_now", "5000000"),
                ("energy_full", "12000000"),
                ("power_now", "10000000"),
            ],
        );
        write_device(
            root.path(),
            "hidpp_battery_0",
            &[
                ("type", "Battery"),
                ("scope", "Device"),
                ("model_name", "MX Master"),
                ("status", "Discharging"),
                ("capacity", "80"),
            ],
        );
        root
    }

    fn config(root: &Path, all_devices: bool) -> ResolvedConfig {
        let mut config = ResolvedConfig::default();
        config.upower.sysfs_root = root.to_path_buf();
        config.upower.all_devices = all_devices;
        config.upower.poll_interval = Duration::from_secs(5);
        config
    }

    fn reading(charge: Charge, percentage: Option<f64>, seconds: Option<u64>) -> Reading {
        Reading {
            charge,
            percentage,
            seconds,
        }
    }

    #[test]
    fn test_present_values() {
        let (value, state) = present(&reading(Charge::Discharging, Some(42.0), Some(3723)));
        assert_eq!(value, "Bat 42.00% (01:02:03)");
        assert_eq!(state, State::Active(StateFlags::AVERAGE));

        let (value, state) = present(&reading(Charge::Charging, Some(99.5), None));
        assert_eq!(value, "Chr 99.50%");
        assert_eq!(state, State::Active(StateFlags::AVERAGE));

        let (value, state) = present(&reading(Charge::Full, None, None));
        assert_eq!(value, "Full");
        assert_eq!(state, State::Active(StateFlags::GOOD));

        let (value, state) = present(&reading(Charge::Empty, Some(0.0), None));
        assert_eq!(value, "Empty 0.00%");
        assert_eq!(state, State::Active(StateFlags::BAD | StateFlags::URGENT));

        let (value, state) = present(&reading(Charge::Unknown, Some(50.0), None));
        assert_eq!(value, "No battery");
        assert_eq!(state, State::Unavailable);
    }

    #[test]
    fn test_low_battery_escalates() {
        let (_, state) = present(&reading(Charge::Discharging, Some(14.0), None));
        assert_eq!(state, State::Active(StateFlags::BAD));

        let (_, state) = present(&reading(Charge::Discharging, Some(4.0), None));
        assert_eq!(state, State::Active(StateFlags::BAD | StateFlags::URGENT));
    }

    #[test]
    fn test_sample_fits_every_value() {
        let (value, _) = present(&reading(Charge::Charging, Some(100.0), Some(86399)));
        assert_eq!(value.chars().count(), SAMPLE_VALUE.chars().count());
    }

    #[test]
    fn test_scan_filters_and_reads() {
        let root = laptop();
        let devices = scan(root.path(), false).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, "BAT0");
        assert_eq!(devices[0].kind, DeviceKind::Battery);
        assert_eq!(
            devices[0].reading,
            reading(Charge::Discharging, Some(42.0), Some(1800))
        );

        let all = scan(root.path(), true).unwrap();
        let ids: Vec<_> = all.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["BAT0", "hidpp_battery_0"]);
        assert_eq!(all[1].kind, DeviceKind::Peripheral);
        assert_eq!(all[1].model.as_deref(), Some("MX Master"));
    }

    #[test]
    fn test_percentage_from_charge_counters() {
        let root = TempDir::new().unwrap();
        write_device(
            root.path(),
            "BAT1",
            &[
                ("type", "Battery"),
                ("status", "Charging"),
                ("charge_now", "1500000"),
                ("charge_full", "3000000"),
                ("current_now", "750000"),
            ],
        );
        let devices = scan(root.path(), false).unwrap();
        assert_eq!(
            devices[0].reading,
            reading(Charge::Charging, Some(50.0), Some(7200))
        );
    }

    #[test]
    fn test_absent_battery_is_unavailable() {
        let root = TempDir::new().unwrap();
        write_device(
            root.path(),
            "BAT0",
            &[("type", "Battery"), ("present", "0"), ("status", "Unknown")],
        );
        let devices = scan(root.path(), false).unwrap();
        assert_eq!(present(&devices[0].reading).1, State::Unavailable);
    }

    #[test]
    fn test_init_without_battery_fails() {
        let root = TempDir::new().unwrap();
        write_device(root.path(), "AC", &[("type", "Mains")]);
        let mut harness = PluginHarness::new();
        let result = harness.init::<Upower, _>(&config(root.path(), false), Upower::init);
        assert!(matches!(result, Err(PluginInitError::Unavailable(_))));

        let missing = root.path().join("nope");
        let result = harness.init::<Upower, _>(&config(&missing, false), Upower::init);
        assert!(matches!(result, Err(PluginInitError::Unavailable(_))));
    }

    #[test]
    fn test_init_registers_sections() {
        let root = laptop();
        let mut harness = PluginHarness::new();
        harness
            .init::<Upower, _>(&config(root.path(), true), Upower::init)
            .unwrap();

        let battery = harness.section("upower-battery", "BAT0").unwrap();
        assert_eq!(battery.value(), Some("Bat 42.00% (00:30:00)"));
        assert_eq!(battery.max_width(), -(SAMPLE_VALUE.chars().count() as i64));
        assert!(!battery.is_actionable());

        let mouse = harness.section("upower-device", "hidpp_battery_0").unwrap();
        assert_eq!(mouse.label(), Some("MX Master"));
        assert_eq!(mouse.value(), Some("Bat 80.00%"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_follows_changes() {
        let root = laptop();
        let mut harness = PluginHarness::new();
        let mut plugin = harness
            .init::<Upower, _>(&config(root.path(), false), Upower::init)
            .unwrap();
        DynInputPlugin::start(&mut plugin, harness.raw());

        write_device(root.path(), "BAT0", &[("status", "Charging"), ("capacity", "43")]);
        harness.pump(&mut plugin).await;
        let battery = harness.section("upower-battery", "BAT0").unwrap();
        assert_eq!(battery.value(), Some("Chr 43.00% (00:42:00)"));
        assert_eq!(battery.state(), State::Active(StateFlags::AVERAGE));

        write_device(root.path(), "BAT1", &[("type", "Battery"), ("status", "Full")]);
        fs::remove_dir_all(root.path().join("BAT0")).unwrap();
        harness.pump(&mut plugin).await;
        assert!(harness.section("upower-battery", "BAT0").is_none());
        assert_eq!(
            harness.section("upower-battery", "BAT1").and_then(Section::value),
            Some("Full")
        );
        harness.abort_tasks();
    }
}
