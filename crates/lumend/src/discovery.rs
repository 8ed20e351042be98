//! Network discovery of fixtures.
//!
//! Yeelight fixtures answer an SSDP-style multicast search on port 1982 with
//! HTTP-like headers, e.g.
//!
//! ```text
//! HTTP/1.1 200 OK
//! Location: yeelight://192.168.1.239:55443
//! id: 0x000000000015243f
//! model: color
//! ```

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::registry::DiscoveredDevice;

const MULTICAST_ADDR: &str = "239.255.255.250:1982";

const SEARCH_REQUEST: &str = "M-SEARCH * HTTP/1.1\r\n\
    HOST: 239.255.255.250:1982\r\n\
    MAN: \"ssdp:discover\"\r\n\
    ST: wifi_bulb\r\n";

/// Finds fixtures on the local network
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Best-effort snapshot; failures produce an empty or partial list
    async fn discover(&self) -> Vec<DiscoveredDevice>;
}

/// Multicast search, collecting replies until `timeout` elapses
pub struct SsdpDiscovery {
    timeout: Duration,
}

impl SsdpDiscovery {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn search(&self) -> std::io::Result<Vec<DiscoveredDevice>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(SEARCH_REQUEST.as_bytes(), MULTICAST_ADDR).await?;

        let deadline = Instant::now() + self.timeout;
        let mut found: Vec<DiscoveredDevice> = Vec::new();
        let mut buf = [0u8; 2048];

        loop {
            let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
            {
                Ok(received) => received?,
                Err(_) => break,
            };

            let text = String::from_utf8_lossy(&buf[..len]);
            let Some(mut device) = parse_reply(&text) else {
                debug!("Ignoring unrecognised discovery reply from {}", from);
                continue;
            };
            if device.ip.is_none() {
                device.ip = Some(from.ip().to_string());
            }

            // Fixtures answer every search packet they see, often twice
            if !found.contains(&device) {
                debug!("Discovered {:?} at {:?}", device.id, device.ip);
                found.push(device);
            }
        }

        Ok(found)
    }
}

#[async_trait]
impl Discovery for SsdpDiscovery {
    async fn discover(&self) -> Vec<DiscoveredDevice> {
        match self.search().await {
            Ok(found) => found,
            Err(e) => {
                warn!("Discovery failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Extract `{ip, id}` from one search reply.
pub fn parse_reply(text: &str) -> Option<DiscoveredDevice> {
    let mut device = DiscoveredDevice::default();

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if key.eq_ignore_ascii_case("location") {
            device.ip = value
                .strip_prefix("yeelight://")
                .and_then(|addr| addr.rsplit_once(':').map(|(host, _)| host).or(Some(addr)))
                .filter(|host| !host.is_empty())
                .map(str::to_string);
        } else if key.eq_ignore_ascii_case("id") && !value.is_empty() {
            device.id = Some(value.to_string());
        }
    }

    if device.ip.is_none() && device.id.is_none() {
        None
    } else {
        Some(device)
    }
}

/// Discovery that always returns the same devices
#[cfg(test)]
pub(crate) struct StaticDiscovery(pub Vec<DiscoveredDevice>);

#[cfg(test)]
#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> Vec<DiscoveredDevice> {
        self.0.clone()
    }
}
