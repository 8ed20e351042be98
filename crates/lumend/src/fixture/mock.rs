//! In-process fixtures for tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use super::BoxedFixture;
use super::Fixture;
use super::FixtureConnector;
use super::FixtureError;
use super::FixturePool;
use super::Flow;
use crate::dispatch::Dispatcher;
use crate::registry::DeviceRecord;
use crate::registry::Directory;
use crate::registry::Groups;
use crate::registry::Registry;
use crate::state::StateStore;
use crate::store::MemoryStore;

#[derive(Debug, Default)]
struct Shared {
    calls: Vec<String>,
    connects: usize,
    failing: HashSet<String>,
    properties: HashMap<String, HashMap<String, String>>,
    delay: Option<Duration>,
}

/// Records every command as `"<ip> <method> <args>"`.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<Shared>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.shared.lock().unwrap().connects
    }

    /// Make every connect and call for `ip` fail
    pub fn set_failing(&self, ip: &str, failing: bool) {
        let mut shared = self.shared.lock().unwrap();
        if failing {
            shared.failing.insert(ip.to_string());
        } else {
            shared.failing.remove(ip);
        }
    }

    pub fn set_properties(&self, ip: &str, props: &[(&str, &str)]) {
        let props = props
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.shared
            .lock()
            .unwrap()
            .properties
            .insert(ip.to_string(), props);
    }

    /// Delay every call, to exercise timeouts
    pub fn set_delay(&self, delay: Duration) {
        self.shared.lock().unwrap().delay = Some(delay);
    }
}

#[async_trait]
impl FixtureConnector for MockConnector {
    async fn connect(&self, ip: &str) -> Result<BoxedFixture, FixtureError> {
        let mut shared = self.shared.lock().unwrap();
        if shared.failing.contains(ip) {
            return Err(FixtureError::Connect(
                ip.to_string(),
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        shared.connects += 1;
        Ok(Box::new(MockFixture {
            ip: ip.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct MockFixture {
    ip: String,
    shared: Arc<Mutex<Shared>>,
}

impl MockFixture {
    async fn record(&self, call: String) -> Result<(), FixtureError> {
        let delay = self.shared.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut shared = self.shared.lock().unwrap();
        if shared.failing.contains(&self.ip) {
            return Err(FixtureError::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )));
        }
        shared.calls.push(format!("{} {}", self.ip, call));
        Ok(())
    }
}

#[async_trait]
impl Fixture for MockFixture {
    async fn set_power(&mut self, on: bool) -> Result<(), FixtureError> {
        self.record(format!("set_power {}", if on { "on" } else { "off" }))
            .await
    }

    async fn set_brightness(&mut self, level: u8) -> Result<(), FixtureError> {
        self.record(format!("set_brightness {}", level)).await
    }

    async fn set_color_temp(&mut self, kelvin: u16) -> Result<(), FixtureError> {
        self.record(format!("set_color_temp {}", kelvin)).await
    }

    async fn set_rgb(&mut self, r: u8, g: u8, b: u8) -> Result<(), FixtureError> {
        self.record(format!("set_rgb {} {} {}", r, g, b)).await
    }

    async fn toggle(&mut self) -> Result<(), FixtureError> {
        self.record("toggle".to_string()).await
    }

    async fn start_flow(&mut self, flow: &Flow) -> Result<(), FixtureError> {
        self.record(format!("start_flow x{}", flow.count)).await
    }

    async fn get_properties(
        &mut self,
        _names: &[&str],
    ) -> Result<HashMap<String, String>, FixtureError> {
        self.record("get_properties".to_string()).await?;
        Ok(self
            .shared
            .lock()
            .unwrap()
            .properties
            .get(&self.ip)
            .cloned()
            .unwrap_or_default())
    }
}

/// Directory with the given `(name, ip)` devices and no groups
pub fn test_directory(devices: &[(&str, &str)]) -> Directory {
    test_directory_with_groups(devices, Groups::new())
}

pub fn test_directory_with_groups(devices: &[(&str, &str)], groups: Groups) -> Directory {
    let registry: Registry = devices
        .iter()
        .map(|(name, ip)| (name.to_string(), DeviceRecord::new(Some(*ip), None)))
        .collect();
    Directory::new(Arc::new(ArcSwap::from_pointee(registry)), groups)
}

/// Dispatcher over `directory` backed by `connector` and an in-memory store
pub async fn test_dispatcher(connector: &MockConnector, directory: Directory) -> Arc<Dispatcher> {
    let fixtures = Arc::new(FixturePool::new(
        Arc::new(connector.clone()),
        directory.clone(),
        Duration::from_secs(1),
    ));
    let states = Arc::new(
        StateStore::load(Arc::new(MemoryStore::new()))
            .await
            .unwrap(),
    );
    Arc::new(Dispatcher::new(directory, fixtures, states))
}
