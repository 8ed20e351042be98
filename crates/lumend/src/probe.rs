//! Host presence probing.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

/// Answers whether a host is currently on the network.
///
/// Best-effort: a host that cannot be confirmed is reported absent.
#[async_trait]
pub trait PresenceProbe: Send + Sync {
    async fn is_reachable(&self, host: &str) -> bool;
}

/// Probes with a single ICMP echo through the system `ping`
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PresenceProbe for PingProbe {
    async fn is_reachable(&self, host: &str) -> bool {
        if host.is_empty() || host.starts_with('-') {
            warn!("Refusing to probe invalid host {:?}", host);
            return false;
        }

        let wait_secs = self.timeout.as_secs().max(1);
        let mut command = Command::new("ping");
        command
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(wait_secs.to_string())
            .arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!("Failed to run ping for {}: {}", host, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out", host);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_option_like_hosts() {
        let probe = PingProbe::new(Duration::from_millis(100));
        assert!(!probe.is_reachable("-f").await);
        assert!(!probe.is_reachable("").await);
    }
}
