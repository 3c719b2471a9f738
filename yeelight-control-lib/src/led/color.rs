use std::str::FromStr;

use clap::ValueEnum;
use palette::{FromColor, Hsv, Srgb};
use serde::{Deserialize, Serialize};

use crate::error::BulbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RGB {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RGB {
    pub fn new(red: u8, green: u8, blue: u8) -> Self {
        RGB { red, green, blue }
    }

    /// Packs the color the way the bulb expects it: `R*65536 + G*256 + B`.
    pub fn packed(&self) -> u32 {
        u32::from(self.red) * 65536 + u32::from(self.green) * 256 + u32::from(self.blue)
    }

    /// Unpacks a color reported by the bulb. Bits above the low 24 are ignored.
    pub fn from_packed(rgb: u32) -> Self {
        RGB {
            red: ((rgb >> 16) & 0xFF) as u8,
            green: ((rgb >> 8) & 0xFF) as u8,
            blue: (rgb & 0xFF) as u8,
        }
    }

    /// Converts a hue (degrees) and saturation (percent) at full value into RGB.
    ///
    /// The bulb's own HSV command has no value component, so callers that want
    /// brightness as well send this color together with a separate brightness.
    pub fn from_hue_saturation(hue: u16, saturation: u8) -> Self {
        let hsv: Hsv = Hsv::new(f32::from(hue), f32::from(saturation) / 100.0, 1.0);
        let rgb: Srgb = Srgb::from_color(hsv);
        let (red, green, blue) = rgb.into_format::<u8>().into_components();
        RGB { red, green, blue }
    }
}

// implement From for (u8,u8,u8) to RGB and vice verse
impl From<(u8, u8, u8)> for RGB {
    fn from(tuple: (u8, u8, u8)) -> Self {
        RGB {
            red: tuple.0,
            green: tuple.1,
            blue: tuple.2,
        }
    }
}

impl From<RGB> for (u8, u8, u8) {
    fn from(rgb: RGB) -> Self {
        (rgb.red, rgb.green, rgb.blue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliColors {
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Magenta,
    Pink,
    Teal,
    White,
    WarmWhite,
}

impl FromStr for CliColors {
    type Err = BulbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "red" => Ok(CliColors::Red),
            "green" => Ok(CliColors::Green),
            "blue" => Ok(CliColors::Blue),
            "yellow" => Ok(CliColors::Yellow),
            "orange" => Ok(CliColors::Orange),
            "purple" => Ok(CliColors::Purple),
            "cyan" => Ok(CliColors::Cyan),
            "magenta" => Ok(CliColors::Magenta),
            "pink" => Ok(CliColors::Pink),
            "teal" => Ok(CliColors::Teal),
            "white" => Ok(CliColors::White),
            "warm-white" => Ok(CliColors::WarmWhite),
            _ => Err(BulbError::InvalidArgument(format!("unknown color: {}", s))),
        }
    }
}

impl From<CliColors> for RGB {
    fn from(color: CliColors) -> Self {
        match color {
            CliColors::Red => RGB::new(255, 0, 0),
            CliColors::Green => RGB::new(0, 255, 0),
            CliColors::Blue => RGB::new(0, 0, 255),
            CliColors::Yellow => RGB::new(255, 255, 0),
            CliColors::Orange => RGB::new(255, 165, 0),
            CliColors::Purple => RGB::new(128, 0, 128),
            CliColors::Cyan => RGB::new(0, 255, 255),
            CliColors::Magenta => RGB::new(255, 0, 255),
            CliColors::Pink => RGB::new(255, 192, 203),
            CliColors::Teal => RGB::new(0, 128, 128),
            CliColors::White => RGB::new(255, 255, 255),
            CliColors::WarmWhite => RGB::new(255, 197, 143),
        }
    }
}
