//! # Yeelight Control Library
//!
//! `yeelight-control-lib` is a Rust library for controlling Yeelight Wi-Fi bulbs over the
//! local network. It discovers bulbs through a multicast search request, keeps a control
//! session open to one of them, and can switch a bulb into streaming ("music") mode for
//! effects that need many updates per second.
//!
//! ## Features
//!
//! - Device discovery on local networks
//! - Command correlation with timeouts, capability checks and power guards
//! - A device record kept current by polling and push notifications
//! - Streaming mode, where the bulb connects back to a local listener
//!
//! ## Example
//!
//! Discover a bulb and turn it on:
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use tokio_util::sync::CancellationToken;
//! use yeelight_control_lib::control_interface::bulb_info::Effect;
//! use yeelight_control_lib::control_interface::{Bulb, BulbConfig};
//! use yeelight_control_lib::util::discovery::Discovery;
//! use yeelight_control_lib::util::traits::LightControl;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cancel = CancellationToken::new();
//!     let devices = Discovery::find_devices(Duration::from_secs(3), &cancel).await?;
//!
//!     if let Some(device) = devices.into_iter().next() {
//!         let bulb = Bulb::connect(device, BulbConfig::default(), &cancel).await?;
//!         bulb.turn_on(Effect::Smooth, Duration::from_millis(500), &cancel)
//!             .await?;
//!         bulb.disconnect().await;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.
// The `control_interface` module holds the control session: the TCP transport,
// command correlation, the state poller and streaming mode.
pub mod control_interface;

pub mod error;

// Color values and the named colors accepted on the command line.
pub mod led;

// Discovery and the `LightControl` command surface shared by control and
// streaming sessions.
pub mod util;
