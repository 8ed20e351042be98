//! Yeelight LAN control protocol.
//!
//! Commands are JSON objects, one per line (`\r\n` terminated), sent over a
//! TCP connection to port 55443:
//!
//! ```text
//! {"id":1,"method":"set_bright","params":[50,"smooth",300]}
//! ```
//!
//! The fixture answers with `{"id":1,"result":["ok"]}` or
//! `{"id":1,"error":{"code":-1,"message":"..."}}`, and may interleave
//! unsolicited `{"method":"props",...}` notifications, which are skipped.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tracing::trace;

use super::BoxedFixture;
use super::Fixture;
use super::FixtureConnector;
use super::FixtureError;
use super::Flow;
use super::Transition;

pub const DEFAULT_PORT: u16 = 55443;

/// Shortest transition the firmware accepts for the `smooth` effect
const MIN_SMOOTH_MS: u64 = 30;

/// Flow action: restore the pre-flow state when the flow ends
const FLOW_RECOVER: u32 = 0;

/// Opens Yeelight connections on a fixed port
#[derive(Debug, Clone)]
pub struct YeelightConnector {
    port: u16,
    transition: Duration,
}

impl YeelightConnector {
    pub fn new(port: u16, transition: Duration) -> Self {
        Self { port, transition }
    }
}

#[async_trait]
impl FixtureConnector for YeelightConnector {
    async fn connect(&self, ip: &str) -> Result<BoxedFixture, FixtureError> {
        let addr = format!("{}:{}", ip, self.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| FixtureError::Connect(addr, e))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(YeelightFixture::new(stream, self.transition)))
    }
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: Option<u64>,
    result: Option<Vec<Value>>,
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// One open Yeelight connection
pub struct YeelightFixture {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    transition_ms: u64,
}

impl YeelightFixture {
    pub fn new(stream: TcpStream, transition: Duration) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
            next_id: 1,
            transition_ms: transition.as_millis() as u64,
        }
    }

    /// Effect and duration params appended to most setters
    fn effect(&self) -> [Value; 2] {
        if self.transition_ms >= MIN_SMOOTH_MS {
            [json!("smooth"), json!(self.transition_ms)]
        } else {
            [json!("sudden"), json!(0)]
        }
    }

    async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Vec<Value>, FixtureError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut line = json!({"id": id, "method": method, "params": params}).to_string();
        trace!("-> {}", line);
        line.push_str("\r\n");
        self.writer.write_all(line.as_bytes()).await?;

        loop {
            let mut buf = String::new();
            if self.reader.read_line(&mut buf).await? == 0 {
                return Err(FixtureError::Protocol("connection closed".to_string()));
            }
            trace!("<- {}", buf.trim_end());

            let reply: Reply = serde_json::from_str(buf.trim())
                .map_err(|e| FixtureError::Protocol(e.to_string()))?;
            if reply.id != Some(id) {
                // props notification or a late reply to an abandoned request
                continue;
            }
            if let Some(error) = reply.error {
                return Err(FixtureError::Rejected {
                    method: method.to_string(),
                    message: format!("{} (code {})", error.message, error.code),
                });
            }
            return Ok(reply.result.unwrap_or_default());
        }
    }

    async fn call_with_effect(&mut self, method: &str, value: Value) -> Result<(), FixtureError> {
        let [effect, duration] = self.effect();
        self.call(method, vec![value, effect, duration]).await?;
        Ok(())
    }
}

/// Encode a flow as the firmware's `duration,mode,value,brightness` tuples
pub fn flow_expression(flow: &Flow) -> String {
    flow.transitions
        .iter()
        .map(|transition| match *transition {
            Transition::Rgb { r, g, b, duration_ms } => {
                format!("{},1,{},100", duration_ms, pack_rgb(r, g, b))
            }
            Transition::Sleep { duration_ms } => format!("{},7,0,0", duration_ms),
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn pack_rgb(r: u8, g: u8, b: u8) -> u32 {
    (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
}

#[async_trait]
impl Fixture for YeelightFixture {
    async fn set_power(&mut self, on: bool) -> Result<(), FixtureError> {
        self.call_with_effect("set_power", json!(if on { "on" } else { "off" }))
            .await
    }

    async fn set_brightness(&mut self, level: u8) -> Result<(), FixtureError> {
        self.call_with_effect("set_bright", json!(level)).await
    }

    async fn set_color_temp(&mut self, kelvin: u16) -> Result<(), FixtureError> {
        self.call_with_effect("set_ct_abx", json!(kelvin)).await
    }

    async fn set_rgb(&mut self, r: u8, g: u8, b: u8) -> Result<(), FixtureError> {
        self.call_with_effect("set_rgb", json!(pack_rgb(r, g, b)))
            .await
    }

    async fn toggle(&mut self) -> Result<(), FixtureError> {
        self.call("toggle", Vec::new()).await?;
        Ok(())
    }

    async fn start_flow(&mut self, flow: &Flow) -> Result<(), FixtureError> {
        let count = flow.count as usize * flow.transitions.len();
        self.call(
            "start_cf",
            vec![json!(count), json!(FLOW_RECOVER), json!(flow_expression(flow))],
        )
        .await?;
        Ok(())
    }

    async fn get_properties(
        &mut self,
        names: &[&str],
    ) -> Result<HashMap<String, String>, FixtureError> {
        let params = names.iter().map(|name| json!(name)).collect();
        let values = self.call("get_prop", params).await?;
        if values.len() != names.len() {
            return Err(FixtureError::Protocol(format!(
                "asked for {} properties, got {}",
                names.len(),
                values.len()
            )));
        }

        Ok(names
            .iter()
            .zip(values)
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (name.to_string(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Accept one connection and answer each request with the given reply
    /// lines, returning the requests that were received.
    async fn fake_bulb(replies: Vec<Vec<&'static str>>) -> (u16, tokio::task::JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut requests = Vec::new();
            for lines in replies {
                let mut buf = String::new();
                reader.read_line(&mut buf).await.unwrap();
                requests.push(serde_json::from_str::<Value>(buf.trim()).unwrap());
                for line in lines {
                    write.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
                }
            }
            requests
        });

        (port, handle)
    }

    #[tokio::test]
    async fn test_set_brightness_request() {
        let (port, bulb) = fake_bulb(vec![vec![r#"{"id":1,"result":["ok"]}"#]]).await;
        let connector = YeelightConnector::new(port, Duration::from_millis(300));

        let mut fixture = connector.connect("127.0.0.1").await.unwrap();
        fixture.set_brightness(42).await.unwrap();

        let requests = bulb.await.unwrap();
        assert_eq!(
            requests[0],
            json!({"id": 1, "method": "set_bright", "params": [42, "smooth", 300]})
        );
    }

    #[tokio::test]
    async fn test_skips_notifications_and_reads_props() {
        let (port, bulb) = fake_bulb(vec![vec![
            r#"{"method":"props","params":{"power":"on"}}"#,
            r#"{"id":1,"result":["on","75",""]}"#,
        ]])
        .await;
        let connector = YeelightConnector::new(port, Duration::ZERO);

        let mut fixture = connector.connect("127.0.0.1").await.unwrap();
        let props = fixture
            .get_properties(&["power", "bright", "rgb"])
            .await
            .unwrap();

        assert_eq!(props["power"], "on");
        assert_eq!(props["bright"], "75");
        assert_eq!(props["rgb"], "");
        bulb.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_reply_is_rejection() {
        let (port, bulb) = fake_bulb(vec![vec![
            r#"{"id":1,"error":{"code":-1,"message":"client quota exceeded"}}"#,
        ]])
        .await;
        let connector = YeelightConnector::new(port, Duration::ZERO);

        let mut fixture = connector.connect("127.0.0.1").await.unwrap();
        let err = fixture.set_power(true).await.unwrap_err();

        assert!(matches!(err, FixtureError::Rejected { ref method, .. } if method == "set_power"));
        let requests = bulb.await.unwrap();
        assert_eq!(requests[0]["params"], json!(["on", "sudden", 0]));
    }

    #[test]
    fn test_pulse_flow_expression() {
        assert_eq!(
            flow_expression(&Flow::pulse()),
            "500,1,16711680,100,200,7,0,0,500,1,255,100,200,7,0,0"
        );
    }
}
