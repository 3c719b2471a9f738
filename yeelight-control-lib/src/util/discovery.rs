use std::cmp::max;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::control_interface::bulb_info::{DeviceRecord, Property};
use crate::error::{BulbError, Result};

const DISCOVERY_MESSAGE: &str =
    "M-SEARCH * HTTP/1.1\r\n HOST:239.255.255.250:1982\r\n MAN:\"ssdp:discover\"\r\n ST:wifi_bulb\r\n";
const MULTICAST_ADDRESS: &str = "239.255.255.250:1982";
const DATAGRAM_SIZE: usize = 1024;

pub struct Discovery;

impl Discovery {
    /**
    Parses one discovery reply into device records.

    Every `Location` line starts a new record; the lines after it fill that
    record in. Header lines the bulb protocol does not define are ignored,
    but a malformed value for a known key fails the whole reply.
    */
    pub fn decode_discovery_response(response: &str) -> Result<Vec<DeviceRecord>> {
        let mut devices: Vec<DeviceRecord> = Vec::new();

        for line in response.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            if key.eq_ignore_ascii_case("Location") {
                devices.push(DeviceRecord::new(Self::parse_location(value)?));
                continue;
            }

            let known = matches!(key, "id" | "support" | "model" | "fw_ver")
                || Property::from_key(key).is_some();
            if !known {
                continue;
            }
            let Some(device) = devices.last_mut() else {
                return Err(BulbError::Parse(format!(
                    "discovery reply has `{}` before any Location line",
                    key
                )));
            };

            match key {
                "id" => device.device_id = value.to_string(),
                "support" => {
                    device.support = value.split_whitespace().map(str::to_string).collect()
                }
                "model" => device.model = value.to_string(),
                "fw_ver" => device.firmware_version = value.to_string(),
                _ => {
                    if let Some(property) = Property::from_key(key) {
                        device.state.apply_property(property, value)?;
                    }
                }
            }
        }

        Ok(devices)
    }

    /// Parses `scheme://ip:port`. The scheme itself is not checked.
    fn parse_location(location: &str) -> Result<SocketAddr> {
        let address = location
            .split_once("://")
            .map(|(_, address)| address)
            .unwrap_or(location)
            .trim_end_matches('/');
        address
            .parse()
            .map_err(|e| BulbError::Parse(format!("bad device address `{}`: {}", location, e)))
    }

    async fn send_search() -> Result<UdpSocket> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| BulbError::network("open discovery socket", e))?;
        socket
            .send_to(DISCOVERY_MESSAGE.as_bytes(), MULTICAST_ADDRESS)
            .await
            .map_err(|e| BulbError::network("send search request", e))?;
        debug!("Sent search request to {}", MULTICAST_ADDRESS);
        Ok(socket)
    }

    /// Receives one datagram, or `None` once `deadline` passes.
    async fn receive(
        socket: &UdpSocket,
        buffer: &mut [u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Option<(String, SocketAddr)>> {
        tokio::select! {
            received = tokio::time::timeout_at(deadline, socket.recv_from(buffer)) => match received {
                Ok(Ok((number_of_bytes, source))) => Ok(Some((
                    String::from_utf8_lossy(&buffer[..number_of_bytes]).into_owned(),
                    source,
                ))),
                Ok(Err(e)) => Err(BulbError::network("read discovery reply", e)),
                Err(_) => Ok(None),
            },
            _ = cancel.cancelled() => Err(BulbError::Cancelled),
        }
    }

    /**
    Sends the search request and parses the first reply.

    Only one datagram is read. When several bulbs answer, the ones whose
    replies arrive later are not reported; use [`Self::find_all_devices`]
    to collect every reply until the timeout.
    */
    pub async fn find_devices(
        given_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceRecord>> {
        let socket = Self::send_search().await?;
        let mut buffer = [0u8; DATAGRAM_SIZE];
        let deadline = Instant::now() + given_timeout;

        match Self::receive(&socket, &mut buffer, deadline, cancel).await? {
            Some((reply, source)) => {
                debug!("Discovery reply from {}:\n{}", source, reply);
                let devices = Self::decode_discovery_response(&reply)?;
                info!("Discovered {} device(s)", devices.len());
                Ok(devices)
            }
            None => Err(BulbError::Timeout(format!(
                "no discovery reply within {:?}",
                given_timeout
            ))),
        }
    }

    /**
    Sends the search request and collects replies until `given_timeout`
    has passed.

    Bulbs repeat their reply, so devices are de-duplicated by id. A reply
    that does not parse is logged and skipped. Returns an empty list when
    nothing answered.
    */
    pub async fn find_all_devices(
        given_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceRecord>> {
        let socket = Self::send_search().await?;
        let mut buffer = [0u8; DATAGRAM_SIZE];
        let deadline = Instant::now() + given_timeout;

        let mut seen = HashSet::<String>::new();
        let mut discovered = Vec::new();

        while let Some((reply, source)) =
            Self::receive(&socket, &mut buffer, deadline, cancel).await?
        {
            let devices = match Self::decode_discovery_response(&reply) {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("Skipping discovery reply from {}: {}", source, e);
                    continue;
                }
            };
            for device in devices {
                if seen.insert(device.device_id.clone()) {
                    info!("Found device {} at {}", device.device_id, device.address);
                    discovered.push(device);
                } else {
                    debug!("Found device {} again, skipping", device.device_id);
                }
            }
        }

        Ok(discovered)
    }

    pub fn pretty_print_devices(devices: &[DeviceRecord]) {
        let max_address_width = devices
            .iter()
            .map(|d| d.address.to_string().len())
            .max()
            .unwrap_or(0);
        let max_device_id_width = devices.iter().map(|d| d.device_id.len()).max().unwrap_or(0);
        let max_model_width = devices.iter().map(|d| d.model.len()).max().unwrap_or(0);
        let max_name_width = devices
            .iter()
            .map(|d| max(d.state.name.len(), 12))
            .max()
            .unwrap_or(0);
        let max_power_width = 5;

        println!(
            "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$} {:<power_width$} Brightness",
            "Address",
            "Device ID",
            "Model",
            "Name",
            "Power",
            address_width = max_address_width + 2,
            device_id_width = max_device_id_width + 2,
            model_width = max_model_width + 2,
            name_width = max_name_width + 2,
            power_width = max_power_width + 2,
        );

        println!(
            "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$} {:<power_width$} ----------",
            "-".repeat(max_address_width),
            "-".repeat(max_device_id_width),
            "-".repeat(max_model_width),
            "-".repeat(max_name_width),
            "-".repeat(max_power_width),
            address_width = max_address_width + 2,
            device_id_width = max_device_id_width + 2,
            model_width = max_model_width + 2,
            name_width = max_name_width + 2,
            power_width = max_power_width + 2,
        );

        for device in devices {
            println!(
                "{:<address_width$} {:<device_id_width$} {:<model_width$} {:<name_width$} {:<power_width$} {}",
                device.address.to_string(),
                device.device_id,
                device.model,
                device.state.name,
                device.state.power.to_string(),
                device.state.brightness,
                address_width = max_address_width + 2,
                device_id_width = max_device_id_width + 2,
                model_width = max_model_width + 2,
                name_width = max_name_width + 2,
                power_width = max_power_width + 2,
            );
        }
    }
}
