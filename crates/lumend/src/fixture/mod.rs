//! Light fixture communication.
//!
//! The core talks to fixtures through the [`Fixture`] trait so the wire
//! protocol stays swappable; [`yeelight`] is the LAN implementation used by
//! the daemon. [`FixturePool`] owns one long-lived handle per device.

pub mod command;
#[cfg(test)]
pub(crate) mod mock;
mod pool;
pub mod yeelight;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

pub use command::Command;
pub use command::Flow;
pub use command::Transition;
pub use pool::FixturePool;

/// Failure talking to a single fixture.
///
/// Always recoverable: the caller logs it, skips the device and keeps the
/// last known state.
#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("no address known for {0}")]
    NoAddress(String),

    #[error("failed to connect to {0}: {1}")]
    Connect(String, #[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("fixture rejected {method}: {message}")]
    Rejected { method: String, message: String },

    #[error("malformed response: {0}")]
    Protocol(String),
}

/// An open connection to one fixture.
#[async_trait]
pub trait Fixture: Send {
    async fn set_power(&mut self, on: bool) -> Result<(), FixtureError>;

    /// Brightness 1-100
    async fn set_brightness(&mut self, level: u8) -> Result<(), FixtureError>;

    /// Colour temperature in kelvin, 1700-6500
    async fn set_color_temp(&mut self, kelvin: u16) -> Result<(), FixtureError>;

    async fn set_rgb(&mut self, r: u8, g: u8, b: u8) -> Result<(), FixtureError>;

    async fn toggle(&mut self) -> Result<(), FixtureError>;

    /// Run a colour flow, restoring the previous state when it ends
    async fn start_flow(&mut self, flow: &Flow) -> Result<(), FixtureError>;

    /// Read raw property values by name
    async fn get_properties(
        &mut self,
        names: &[&str],
    ) -> Result<HashMap<String, String>, FixtureError>;
}

pub type BoxedFixture = Box<dyn Fixture>;

/// Opens fixture connections.
#[async_trait]
pub trait FixtureConnector: Send + Sync {
    async fn connect(&self, ip: &str) -> Result<BoxedFixture, FixtureError>;
}
