use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::BoxedFixture;
use super::Command;
use super::FixtureConnector;
use super::FixtureError;
use crate::registry::Directory;

/// Connection slot for one device name
#[derive(Default)]
struct Slot {
    /// Address the open handle was connected to
    ip: Option<String>,
    fixture: Option<BoxedFixture>,
}

impl Slot {
    /// Return the open handle, (re)connecting if there is none or the
    /// registry now lists a different address.
    async fn ensure(
        &mut self,
        ip: &str,
        connector: &dyn FixtureConnector,
    ) -> Result<&mut BoxedFixture, FixtureError> {
        if self.ip.as_deref() != Some(ip) {
            self.fixture = None;
        }
        let fixture = match self.fixture.take() {
            Some(fixture) => fixture,
            None => {
                debug!("Connecting to fixture at {}", ip);
                let fixture = connector.connect(ip).await?;
                self.ip = Some(ip.to_string());
                fixture
            }
        };
        Ok(self.fixture.insert(fixture))
    }

    fn reset(&mut self) {
        self.fixture = None;
    }
}

/// Long-lived fixture handles, one per device name.
///
/// Calls for the same device are serialised on that device's slot (fixtures
/// do not pipeline commands); different devices proceed in parallel. Every
/// call is bounded by `timeout`, and any failure drops the handle so the
/// next call reconnects.
pub struct FixturePool {
    connector: Arc<dyn FixtureConnector>,
    directory: Directory,
    timeout: Duration,
    slots: std::sync::Mutex<HashMap<String, Arc<Mutex<Slot>>>>,
}

impl FixturePool {
    pub fn new(connector: Arc<dyn FixtureConnector>, directory: Directory, timeout: Duration) -> Self {
        Self {
            connector,
            directory,
            timeout,
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, name: &str) -> Arc<Mutex<Slot>> {
        match self.slots.lock() {
            Ok(mut slots) => slots.entry(name.to_string()).or_default().clone(),
            // poisoned: hand out an unpooled slot
            Err(_) => Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Send one command to a device
    pub async fn execute(&self, name: &str, command: &Command) -> Result<(), FixtureError> {
        let ip = self
            .directory
            .address(name)
            .ok_or_else(|| FixtureError::NoAddress(name.to_string()))?;
        let slot = self.slot(name);
        let mut slot = slot.lock().await;

        let outcome = tokio::time::timeout(self.timeout, async {
            let fixture = slot.ensure(&ip, self.connector.as_ref()).await?;
            command.execute(&mut **fixture).await
        })
        .await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                slot.reset();
                Err(e)
            }
            Err(_) => {
                slot.reset();
                Err(FixtureError::Timeout(self.timeout))
            }
        }
    }

    /// Read raw properties from a device
    pub async fn properties(
        &self,
        name: &str,
        props: &[&str],
    ) -> Result<HashMap<String, String>, FixtureError> {
        let ip = self
            .directory
            .address(name)
            .ok_or_else(|| FixtureError::NoAddress(name.to_string()))?;
        let slot = self.slot(name);
        let mut slot = slot.lock().await;

        let outcome = tokio::time::timeout(self.timeout, async {
            let fixture = slot.ensure(&ip, self.connector.as_ref()).await?;
            fixture.get_properties(props).await
        })
        .await;

        match outcome {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(e)) => {
                slot.reset();
                Err(e)
            }
            Err(_) => {
                slot.reset();
                Err(FixtureError::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::mock::MockConnector;
    use crate::fixture::mock::test_directory;

    #[tokio::test]
    async fn test_reuses_connection() {
        let connector = MockConnector::new();
        let pool = FixturePool::new(
            Arc::new(connector.clone()),
            test_directory(&[("desk", "10.0.0.2")]),
            Duration::from_secs(1),
        );

        pool.execute("desk", &Command::SetPower(true)).await.unwrap();
        pool.execute("desk", &Command::SetBrightness(30)).await.unwrap();

        assert_eq!(connector.connects(), 1);
        assert_eq!(
            connector.calls(),
            vec!["10.0.0.2 set_power on", "10.0.0.2 set_brightness 30"]
        );
    }

    #[tokio::test]
    async fn test_missing_address() {
        let pool = FixturePool::new(
            Arc::new(MockConnector::new()),
            test_directory(&[]),
            Duration::from_secs(1),
        );

        let err = pool.execute("ghost", &Command::Toggle).await.unwrap_err();
        assert!(matches!(err, FixtureError::NoAddress(ref name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_failure_drops_handle() {
        let connector = MockConnector::new();
        let pool = FixturePool::new(
            Arc::new(connector.clone()),
            test_directory(&[("desk", "10.0.0.2")]),
            Duration::from_secs(1),
        );

        pool.execute("desk", &Command::SetPower(true)).await.unwrap();
        connector.set_failing("10.0.0.2", true);
        assert!(pool.execute("desk", &Command::SetPower(false)).await.is_err());
        connector.set_failing("10.0.0.2", false);
        pool.execute("desk", &Command::SetPower(false)).await.unwrap();

        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let connector = MockConnector::new();
        connector.set_delay(Duration::from_millis(500));
        let pool = FixturePool::new(
            Arc::new(connector.clone()),
            test_directory(&[("desk", "10.0.0.2")]),
            Duration::from_millis(20),
        );

        let err = pool.execute("desk", &Command::Toggle).await.unwrap_err();
        assert!(matches!(err, FixtureError::Timeout(_)));
    }
}
