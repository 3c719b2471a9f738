use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::control_interface::bulb_info::{ColorMode, DeviceRecord, Effect, PowerStatus};
use crate::control_interface::command::methods;
use crate::control_interface::CommandChannel;
use crate::error::{BulbError, Result};
use crate::led::color::RGB;

/// Bulb-side duration parameters are whole milliseconds.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn check_brightness(brightness: u8) -> Result<()> {
    if !(1..=100).contains(&brightness) {
        return Err(BulbError::InvalidArgument(format!(
            "brightness must be between 1 and 100, got {}",
            brightness
        )));
    }
    Ok(())
}

/// The command surface shared by a control session ([`crate::control_interface::Bulb`])
/// and a streaming view ([`crate::control_interface::streaming::StreamingBulb`]).
///
/// This is what effect generators and remote accessories drive. Every
/// command updates the local record optimistically once it succeeds.
#[async_trait]
pub trait LightControl: Send + Sync {
    fn channel(&self) -> &CommandChannel;

    /// Last known power state.
    fn power(&self) -> PowerStatus {
        self.channel().power()
    }

    /// A copy of the device record as it is right now.
    fn snapshot(&self) -> DeviceRecord {
        self.channel().snapshot()
    }

    async fn turn_on(
        &self,
        effect: Effect,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.channel()
            .execute(
                methods::SET_POWER,
                vec![json!("on"), json!(effect.as_str()), json!(millis(duration))],
                cancel,
            )
            .await?;
        self.channel().update_state(|state| state.power = PowerStatus::On);
        Ok(())
    }

    async fn turn_off(
        &self,
        effect: Effect,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.channel()
            .execute(
                methods::SET_POWER,
                vec![json!("off"), json!(effect.as_str()), json!(millis(duration))],
                cancel,
            )
            .await?;
        self.channel().update_state(|state| state.power = PowerStatus::Off);
        Ok(())
    }

    async fn toggle(
        &self,
        effect: Effect,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let before = self.power();
        self.channel()
            .execute(
                methods::TOGGLE,
                vec![json!(effect.as_str()), json!(millis(duration))],
                cancel,
            )
            .await?;
        self.channel().update_state(|state| {
            state.power = match before {
                PowerStatus::On => PowerStatus::Off,
                PowerStatus::Off => PowerStatus::On,
            }
        });
        Ok(())
    }

    /// Sets brightness in percent (1..=100).
    async fn set_brightness(
        &self,
        brightness: u8,
        effect: Effect,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_brightness(brightness)?;
        self.channel()
            .execute(
                methods::SET_BRIGHT,
                vec![json!(brightness), json!(effect.as_str()), json!(millis(duration))],
                cancel,
            )
            .await?;
        self.channel().update_state(|state| state.brightness = brightness);
        Ok(())
    }

    async fn set_rgb(
        &self,
        rgb: RGB,
        effect: Effect,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let packed = rgb.packed();
        self.channel()
            .execute(
                methods::SET_RGB,
                vec![json!(packed), json!(effect.as_str()), json!(millis(duration))],
                cancel,
            )
            .await?;
        self.channel().update_state(|state| {
            state.rgb = packed;
            state.color_mode = ColorMode::Rgb;
        });
        Ok(())
    }

    /// Sets hue (0..=359), saturation (0..=100) and brightness (1..=100) in
    /// one step.
    ///
    /// `set_hsv` on the bulb cannot change brightness, so this runs a
    /// single-transition color flow to the equivalent RGB color instead and
    /// stays on its final state.
    async fn set_hsv(
        &self,
        hue: u16,
        saturation: u8,
        brightness: u8,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if hue > 359 {
            return Err(BulbError::InvalidArgument(format!(
                "hue must be between 0 and 359, got {}",
                hue
            )));
        }
        if saturation > 100 {
            return Err(BulbError::InvalidArgument(format!(
                "saturation must be between 0 and 100, got {}",
                saturation
            )));
        }
        check_brightness(brightness)?;

        let packed = RGB::from_hue_saturation(hue, saturation).packed();
        let flow = format!("{},1,{},{}", millis(duration), packed, brightness);
        self.channel()
            .execute(methods::START_CF, vec![json!(1), json!(1), json!(flow)], cancel)
            .await?;
        self.channel().update_state(|state| {
            state.hue = hue;
            state.saturation = saturation;
            state.brightness = brightness;
            state.rgb = packed;
            state.color_mode = ColorMode::Rgb;
        });
        Ok(())
    }
}
