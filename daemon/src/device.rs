/// Device status reported to the worker every tick, and the host identity
/// pushed once per setup.
///
/// The worker uses the device status to enforce its own preferences
/// (suspend on battery, suspend while the user is active, ...) but cannot
/// read most of it itself, so the supervisor samples it from sysfs.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryState {
    Unknown,
    Charging,
    Discharging,
    NotCharging,
    Full,
}

impl BatteryState {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "Charging" => BatteryState::Charging,
            "Discharging" => BatteryState::Discharging,
            "Not charging" => BatteryState::NotCharging,
            "Full" => BatteryState::Full,
            _ => BatteryState::Unknown,
        }
    }
}

/// Power and connectivity fields captured from the OS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerFields {
    pub on_ac_power: bool,
    pub on_usb_power: bool,
    pub battery_present: bool,
    pub battery_charge_pct: Option<f64>,
    pub battery_state: BatteryState,
    pub battery_temperature_celsius: Option<f64>,
    pub wifi_online: bool,
}

impl Default for PowerFields {
    fn default() -> Self {
        Self {
            on_ac_power: false,
            on_usb_power: false,
            battery_present: false,
            battery_charge_pct: None,
            battery_state: BatteryState::Unknown,
            battery_temperature_celsius: None,
            wifi_online: false,
        }
    }
}

/// One reporting cycle's view of the device. Built fresh, sent once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusSnapshot {
    pub display_on: bool,
    /// The worker treats an active display as an active user.
    pub user_active: bool,
    pub power: PowerFields,
}

/// Produces a [`DeviceStatusSnapshot`] for the current display state.
pub trait DeviceStatusSource: Send {
    fn snapshot(&mut self, display_on: bool) -> DeviceStatusSnapshot;
}

/// Reads power supplies and network interfaces from sysfs.
pub struct SysfsDeviceSource {
    power_supply_dir: PathBuf,
    net_dir: PathBuf,
}

impl SysfsDeviceSource {
    pub fn new(power_supply_dir: impl Into<PathBuf>, net_dir: impl Into<PathBuf>) -> Self {
        Self { power_supply_dir: power_supply_dir.into(), net_dir: net_dir.into() }
    }
}

impl DeviceStatusSource for SysfsDeviceSource {
    fn snapshot(&mut self, display_on: bool) -> DeviceStatusSnapshot {
        let mut power = read_power_supplies(&self.power_supply_dir);
        power.wifi_online = wifi_online(&self.net_dir);
        DeviceStatusSnapshot { display_on, user_active: display_on, power }
    }
}

fn read_attr(dir: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(dir.join(name)).ok().map(|s| s.trim().to_string())
}

fn supply_online(dir: &Path) -> bool {
    read_attr(dir, "online").as_deref() == Some("1")
}

/// Scans `/sys/class/power_supply`-style entries. Missing directories or
/// attributes simply leave the corresponding fields at their defaults.
pub fn read_power_supplies(root: &Path) -> PowerFields {
    let mut power = PowerFields::default();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return power,
    };

    for entry in entries.flatten() {
        let dir = entry.path();
        match read_attr(&dir, "type").as_deref() {
            Some("Mains") => power.on_ac_power |= supply_online(&dir),
            Some("USB") => power.on_usb_power |= supply_online(&dir),
            Some("Battery") => {
                if read_attr(&dir, "present").as_deref() == Some("0") {
                    continue;
                }
                power.battery_present = true;
                power.battery_charge_pct =
                    read_attr(&dir, "capacity").and_then(|v| v.parse::<f64>().ok());
                power.battery_state = read_attr(&dir, "status")
                    .map(|s| BatteryState::parse(&s))
                    .unwrap_or(BatteryState::Unknown);
                // Reported in tenths of a degree.
                power.battery_temperature_celsius = read_attr(&dir, "temp")
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(|t| t / 10.0);
            }
            _ => {}
        }
    }
    power
}

/// True when any wireless interface is up.
pub fn wifi_online(net_dir: &Path) -> bool {
    let entries = match std::fs::read_dir(net_dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    entries.flatten().any(|entry| {
        let dir = entry.path();
        dir.join("wireless").is_dir() && read_attr(&dir, "operstate").as_deref() == Some("up")
    })
}

/// Human-readable device model and OS version reported to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct HostIdentity {
    pub model: String,
    pub os_version: String,
}

impl HostIdentity {
    pub fn detect() -> Self {
        let os = System::name().unwrap_or_else(|| std::env::consts::OS.to_string());
        let host = System::host_name().unwrap_or_else(|| "unknown".to_string());
        let kernel = System::kernel_version().unwrap_or_default();
        let arch = host_arch();
        Self {
            model: format!("{os} {host} - kernel:{kernel} arch:{arch}"),
            os_version: System::os_version().unwrap_or_default(),
        }
    }
}

/// CPU architecture string of the running kernel (`uname -m`).
pub fn host_arch() -> String {
    match nix::sys::utsname::uname() {
        Ok(uts) => uts.machine().to_string_lossy().into_owned(),
        Err(_) => std::env::consts::ARCH.to_string(),
    }
}
