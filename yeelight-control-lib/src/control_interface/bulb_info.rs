use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

use clap::ValueEnum;
use derivative::Derivative;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BulbError, Result};
use crate::led::color::RGB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    On,
    #[default]
    Off,
}

impl FromStr for PowerStatus {
    type Err = BulbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(PowerStatus::On),
            "off" => Ok(PowerStatus::Off),
            _ => Err(BulbError::Parse(format!("invalid power status: {:?}", s))),
        }
    }
}

impl fmt::Display for PowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerStatus::On => write!(f, "on"),
            PowerStatus::Off => write!(f, "off"),
        }
    }
}

/// Color mode as reported by the bulb (`1`, `2` or `3` on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorMode {
    #[default]
    Rgb,
    ColorTemperature,
    Hsv,
}

impl ColorMode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ColorMode::Rgb),
            2 => Some(ColorMode::ColorTemperature),
            3 => Some(ColorMode::Hsv),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            ColorMode::Rgb => 1,
            ColorMode::ColorTemperature => 2,
            ColorMode::Hsv => 3,
        }
    }
}

/// Transition style for commands that change the light.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Sudden,
    Smooth,
}

impl Effect {
    pub fn as_str(self) -> &'static str {
        match self {
            Effect::Sudden => "sudden",
            Effect::Smooth => "smooth",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property of the observed snapshot, named the way the protocol names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Power,
    Bright,
    ColorMode,
    ColorTemperature,
    Rgb,
    Hue,
    Saturation,
    Name,
}

impl Property {
    /// Properties requested by the poller, in request order.
    ///
    /// The bulb answers `get_prop` positionally, so the index of a value in
    /// the reply is its index in this list.
    pub const POLLED: [Property; 8] = [
        Property::Power,
        Property::Bright,
        Property::ColorMode,
        Property::ColorTemperature,
        Property::Rgb,
        Property::Hue,
        Property::Saturation,
        Property::Name,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Property::Power => "power",
            Property::Bright => "bright",
            Property::ColorMode => "color_mode",
            Property::ColorTemperature => "ct",
            Property::Rgb => "rgb",
            Property::Hue => "hue",
            Property::Saturation => "sat",
            Property::Name => "name",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "power" => Some(Property::Power),
            "bright" => Some(Property::Bright),
            "color_mode" => Some(Property::ColorMode),
            "ct" => Some(Property::ColorTemperature),
            "rgb" => Some(Property::Rgb),
            "hue" => Some(Property::Hue),
            "sat" => Some(Property::Saturation),
            "name" => Some(Property::Name),
            _ => None,
        }
    }
}

/// The mutable part of a device record.
///
/// Poll replies and push notifications both write here without any ordering
/// between them; each field holds whichever update was applied last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulbState {
    pub power: PowerStatus,
    /// Range 1..=100.
    pub brightness: u8,
    pub color_mode: ColorMode,
    pub color_temperature: u16,
    /// Packed as `R*65536 + G*256 + B`.
    pub rgb: u32,
    /// Range 0..=359.
    pub hue: u16,
    /// Range 0..=100.
    pub saturation: u8,
    pub name: String,
}

fn parse_number<T: FromStr>(property: Property, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        BulbError::Parse(format!("invalid value {:?} for {}", raw, property.key()))
    })
}

impl BulbState {
    /// Applies one textual property value. Numeric values are parsed with the
    /// width of their field, so an out-of-range value is an error.
    pub fn apply_property(&mut self, property: Property, raw: &str) -> Result<()> {
        match property {
            Property::Power => self.power = raw.trim().parse()?,
            Property::Bright => self.brightness = parse_number(property, raw)?,
            Property::ColorMode => {
                let code: u8 = parse_number(property, raw)?;
                self.color_mode = ColorMode::from_code(code).ok_or_else(|| {
                    BulbError::Parse(format!("unknown color mode: {}", code))
                })?;
            }
            Property::ColorTemperature => self.color_temperature = parse_number(property, raw)?,
            Property::Rgb => self.rgb = parse_number(property, raw)?,
            Property::Hue => self.hue = parse_number(property, raw)?,
            Property::Saturation => self.saturation = parse_number(property, raw)?,
            Property::Name => self.name = raw.to_string(),
        }
        Ok(())
    }

    /// Applies a `get_prop` reply for [`Property::POLLED`].
    ///
    /// Values that fail to parse are logged and skipped; the rest still apply.
    /// Extra values beyond the requested list are ignored.
    pub fn apply_polled(&mut self, values: &[String]) {
        for (property, raw) in Property::POLLED.iter().zip(values) {
            if let Err(e) = self.apply_property(*property, raw) {
                warn!("Skipping polled {}: {}", property.key(), e);
            }
        }
    }

    /// Applies the params of a `props` notification.
    pub fn apply_notification(&mut self, params: &Map<String, Value>) {
        for (key, value) in params {
            let Some(property) = Property::from_key(key) else {
                debug!("Ignoring notified property {}", key);
                continue;
            };
            let raw = match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                other => {
                    warn!("Skipping notified {}: unexpected value {}", key, other);
                    continue;
                }
            };
            if let Err(e) = self.apply_property(property, &raw) {
                warn!("Skipping notified {}: {}", key, e);
            }
        }
    }
}

/// Identity of one bulb plus its last observed state.
///
/// Two records are the same device when their identity matches; the
/// observed state is ignored for equality and hashing.
#[derive(Derivative)]
#[derivative(Hash, PartialEq, Eq)]
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub address: SocketAddr,
    pub device_id: String,
    pub model: String,
    pub firmware_version: String,
    /// Method names the bulb accepts.
    pub support: Vec<String>,

    #[derivative(Hash = "ignore", PartialEq = "ignore")]
    pub state: BulbState,
}

impl DeviceRecord {
    pub fn new(address: SocketAddr) -> Self {
        DeviceRecord {
            address,
            device_id: String::new(),
            model: String::new(),
            firmware_version: String::new(),
            support: Vec::new(),
            state: BulbState::default(),
        }
    }

    pub fn supports(&self, method: &str) -> bool {
        self.support.iter().any(|m| m == method)
    }

    pub fn rgb(&self) -> RGB {
        RGB::from_packed(self.state.rgb)
    }
}

/// The device record shared between a session, its background tasks and
/// any streaming view. One lock guards the whole record.
#[derive(Debug, Clone)]
pub(crate) struct SharedRecord(Arc<RwLock<DeviceRecord>>);

impl SharedRecord {
    pub(crate) fn new(record: DeviceRecord) -> Self {
        SharedRecord(Arc::new(RwLock::new(record)))
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&DeviceRecord) -> R) -> R {
        f(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut DeviceRecord) -> R) -> R {
        f(&mut self.0.write().unwrap_or_else(PoisonError::into_inner))
    }
}
