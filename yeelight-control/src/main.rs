use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, LevelFilter};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use yeelight_control_lib::control_interface::bulb_info::{DeviceRecord, Effect};
use yeelight_control_lib::control_interface::streaming::StreamingBulb;
use yeelight_control_lib::control_interface::{Bulb, BulbConfig};
use yeelight_control_lib::led::color::{CliColors, RGB};
use yeelight_control_lib::util::discovery::Discovery;
use yeelight_control_lib::util::traits::LightControl;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.debug {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.init();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_interrupt.cancel();
        }
    });

    handle_cli(cli, cancel).await
}

/// This struct defines the command line interface of the application
#[derive(Parser)]
#[clap(
    name = "yeelight_control",
    about = "Controls Yeelight smart bulbs on the local network",
    version = "0.1.0"
)]
pub struct Cli {
    /// Enables debug logging
    #[clap(long, global = true, env = "YEELIGHT_DEBUG")]
    pub debug: bool,

    /// Local port the bulb connects back to in streaming mode (0 picks a free port)
    #[clap(long, global = true, env = "YEELIGHT_STREAMING_PORT", default_value_t = 0)]
    pub streaming_port: u16,

    /// Interval between property polls in milliseconds
    #[clap(long, global = true, env = "YEELIGHT_POLL_INTERVAL_MS", default_value = "2000", value_parser = parse_duration)]
    pub poll_interval: Duration,

    /// How long a command waits for its reply in milliseconds
    #[clap(long, global = true, env = "YEELIGHT_COMMAND_TIMEOUT_MS", default_value = "3000", value_parser = parse_duration)]
    pub command_timeout: Duration,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    fn bulb_config(&self) -> BulbConfig {
        BulbConfig::default()
            .with_poll_interval(self.poll_interval)
            .with_command_timeout(self.command_timeout)
            .with_streaming_port(self.streaming_port)
    }
}

/// Supported output formats for the `discover` command.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    /// Plain text format.
    Plaintext,
    /// JSON format.
    Json,
    /// YAML format.
    Yaml,
}

/// Subcommands available for the CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Subcommand for operations that require device communication
    #[clap(name = "device-call")]
    DeviceCall {
        /// Sets the IP address of the bulb
        #[clap(long)]
        ip: IpAddr,

        /// Overrides the control port advertised by the bulb
        #[clap(long)]
        port: Option<u16>,

        /// How long to search for the bulb in milliseconds
        #[clap(short = 't', long = "timeout", default_value = "3000", value_parser = parse_duration)]
        timeout: Duration,

        #[clap(subcommand)]
        action: DeviceAction,
    },
    /// Searches the local network for bulbs
    #[clap(name = "discover")]
    Discover {
        /// Output format (plaintext, json, yaml)
        #[clap(short, long, value_enum, default_value_t = OutputFormat::Plaintext)]
        output: OutputFormat,

        /// Search timeout in milliseconds
        #[clap(short = 't', long = "timeout", default_value = "3000", value_parser = parse_duration)]
        timeout: Duration,

        /// Keeps listening until the timeout instead of stopping at the first reply
        #[clap(long)]
        all: bool,
    },
}

fn parse_duration(s: &str) -> Result<Duration, &'static str> {
    let millis = s
        .parse::<u64>()
        .map_err(|_| "could not parse duration in milliseconds")?;
    Ok(Duration::from_millis(millis))
}

const MIN_FPS: f64 = 0.1;
const MAX_FPS: f64 = 100.0;

fn parse_fps(s: &str) -> Result<f64, String> {
    let fps = s
        .parse::<f64>()
        .map_err(|_| format!("could not parse frame rate {:?}", s))?;
    if !(MIN_FPS..=MAX_FPS).contains(&fps) {
        return Err(format!(
            "frame rate must be between {} and {}",
            MIN_FPS, MAX_FPS
        ));
    }
    Ok(fps)
}

/// Actions available under the `device-call` subcommand
#[derive(Subcommand)]
pub enum DeviceAction {
    /// Polls and prints the bulb's properties.
    #[clap(name = "get-props")]
    GetProps,
    /// Turns the bulb on.
    On {
        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Turns the bulb off.
    Off {
        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Toggles the bulb.
    Toggle {
        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Sets the brightness in percent.
    Brightness {
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        brightness: u8,
        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Sets a color by name or by its components.
    Rgb {
        /// The color to display by name
        #[clap(value_enum)]
        color: Option<CliColors>,

        /// Red component of the color (0-255)
        #[clap(short = 'r', long = "red", value_parser = clap::value_parser!(u8))]
        red: Option<u8>,

        /// Green component of the color (0-255)
        #[clap(short = 'g', long = "green", value_parser = clap::value_parser!(u8))]
        green: Option<u8>,

        /// Blue component of the color (0-255)
        #[clap(short = 'b', long = "blue", value_parser = clap::value_parser!(u8))]
        blue: Option<u8>,

        #[clap(long, value_enum, default_value_t = Effect::Smooth)]
        effect: Effect,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Sets hue, saturation and brightness together.
    Hsv {
        #[clap(value_parser = clap::value_parser!(u16).range(0..=359))]
        hue: u16,
        #[clap(value_parser = clap::value_parser!(u8).range(0..=100))]
        saturation: u8,
        #[clap(value_parser = clap::value_parser!(u8).range(1..=100))]
        brightness: u8,
        /// Transition time in milliseconds
        #[clap(long, default_value = "500", value_parser = parse_duration)]
        duration: Duration,
    },
    /// Saves the current state as the power-on default.
    #[clap(name = "set-default")]
    SetDefault,
    /// Cycles through the color wheel in streaming mode.
    #[clap(name = "stream-cycle")]
    StreamCycle {
        /// Color updates per second (0.1-100)
        #[clap(long, default_value = "20", value_parser = parse_fps)]
        fps: f64,

        /// How long to run in milliseconds
        #[clap(long, default_value = "10000", value_parser = parse_duration)]
        duration: Duration,

        /// Hue degrees advanced per update
        #[clap(long, default_value_t = 3)]
        step: u16,
    },
}

/// Finds the bulb at `ip`. Discovery is needed even for a known address
/// because commands are checked against the bulb's support list.
async fn locate(
    ip: IpAddr,
    port: Option<u16>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DeviceRecord> {
    let devices = Discovery::find_all_devices(timeout, cancel).await?;
    let mut device = devices
        .into_iter()
        .find(|device| device.address.ip() == ip)
        .ok_or_else(|| anyhow!("No bulb answered discovery from {}", ip))?;
    if let Some(port) = port {
        device.address.set_port(port);
    }
    Ok(device)
}

async fn stream_cycle(
    bulb: StreamingBulb,
    session: CancellationToken,
    fps: f64,
    duration: Duration,
    step: u16,
) -> Result<()> {
    info!("Streaming to bulb at {}", bulb.peer_addr());

    let mut ticker = interval(Duration::from_secs_f64(1.0 / fps.clamp(MIN_FPS, MAX_FPS)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let end = Instant::now() + duration;
    let mut hue: u16 = 0;
    let mut frames: u64 = 0;

    while Instant::now() < end {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let color = RGB::from_hue_saturation(hue, 100);
        bulb.set_rgb(color, Effect::Sudden, Duration::ZERO, &session)
            .await?;
        hue = (hue + step) % 360;
        frames += 1;
    }

    println!("Sent {} color updates.", frames);
    Ok(())
}

async fn handle_cli(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let config = cli.bulb_config();

    match cli.command {
        Commands::Discover {
            output,
            timeout,
            all,
        } => {
            let devices = if all {
                Discovery::find_all_devices(timeout, &cancel).await?
            } else {
                Discovery::find_devices(timeout, &cancel).await?
            };
            match output {
                OutputFormat::Plaintext => {
                    Discovery::pretty_print_devices(&devices);
                }
                OutputFormat::Json => {
                    let json = serde_json::to_string(&devices)?;
                    println!("{}", json);
                }
                OutputFormat::Yaml => {
                    let yaml = serde_yaml::to_string(&devices)?;
                    println!("{}", yaml);
                }
            }
        }
        Commands::DeviceCall {
            ip,
            port,
            timeout,
            action,
        } => {
            let device = locate(ip, port, timeout, &cancel).await?;
            let bulb = Bulb::connect(device, config, &cancel).await?;

            let outcome = run_action(&bulb, action, &cancel).await;
            bulb.disconnect().await;
            outcome?;
        }
    }

    Ok(())
}

async fn run_action(bulb: &Bulb, action: DeviceAction, cancel: &CancellationToken) -> Result<()> {
    match action {
        DeviceAction::GetProps => {
            let record = bulb.refresh(cancel).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        DeviceAction::On { effect, duration } => {
            bulb.turn_on(effect, duration, cancel).await?;
            println!("Bulb turned on.");
        }
        DeviceAction::Off { effect, duration } => {
            bulb.turn_off(effect, duration, cancel).await?;
            println!("Bulb turned off.");
        }
        DeviceAction::Toggle { effect, duration } => {
            bulb.toggle(effect, duration, cancel).await?;
            println!("Bulb is now {}.", bulb.power());
        }
        DeviceAction::Brightness {
            brightness,
            effect,
            duration,
        } => {
            bulb.set_brightness(brightness, effect, duration, cancel)
                .await?;
            println!("Brightness set to {}%.", brightness);
        }
        DeviceAction::Rgb {
            color,
            red,
            green,
            blue,
            effect,
            duration,
        } => {
            let color_to_show = match (color, red, green, blue) {
                (Some(color_name), None, None, None) => color_name.into(),
                (None, Some(r), Some(g), Some(b)) => RGB::new(r, g, b),
                _ => return Err(anyhow!("Give either a color name or all of -r, -g and -b")),
            };
            bulb.set_rgb(color_to_show, effect, duration, cancel)
                .await?;
            println!("Displayed color: {:?}", color_to_show);
        }
        DeviceAction::Hsv {
            hue,
            saturation,
            brightness,
            duration,
        } => {
            bulb.set_hsv(hue, saturation, brightness, duration, cancel)
                .await?;
            println!(
                "Set hue {}, saturation {}%, brightness {}%.",
                hue, saturation, brightness
            );
        }
        DeviceAction::SetDefault => {
            bulb.set_default(cancel).await?;
            println!("Current state saved as default.");
        }
        DeviceAction::StreamCycle {
            fps,
            duration,
            step,
        } => {
            bulb.enable_streaming_mode(cancel, |streaming, session| {
                stream_cycle(streaming, session, fps, duration, step)
            })
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("20").unwrap(), 20.0);
        assert_eq!(parse_fps("0.1").unwrap(), 0.1);
        assert!(parse_fps("0").is_err());
        assert!(parse_fps("1e9").is_err());
        assert!(parse_fps("1e-300").is_err());
        assert!(parse_fps("NaN").is_err());
        assert!(parse_fps("fast").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("-1").is_err());
    }
}
