//! Serial-line transport: pipe-delimited text commands, one frame per line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use smol_str::SmolStr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ControllerConfig;
use crate::error::{CommandError, RuntimeError};
use crate::io::{
    classify_frame, InboundMessage, Packet, Transport, TransportEvent, TransportEvents,
    TransportFuture,
};

const DEFAULT_BAUD_RATE: u32 = 115_200;
const FIELD_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    pub path: String,
    pub baud_rate: u32,
}

#[derive(Debug, Deserialize)]
struct SerialToml {
    path: Option<String>,
    port: Option<String>,
    baud_rate: Option<u32>,
}

impl SerialConfig {
    pub fn from_params(value: &toml::Value) -> Result<Self, RuntimeError> {
        let params: SerialToml = value
            .clone()
            .try_into()
            .map_err(|err| RuntimeError::InvalidConfig(format!("serial params: {err}").into()))?;
        let path = params
            .path
            .or(params.port)
            .filter(|path| !path.trim().is_empty())
            .ok_or_else(|| RuntimeError::InvalidConfig("serial params.path is required".into()))?;
        let baud_rate = params.baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
        if baud_rate == 0 {
            return Err(RuntimeError::InvalidConfig(
                "serial params.baud_rate must be positive".into(),
            ));
        }
        Ok(Self { path, baud_rate })
    }

    pub fn validate_params(value: &toml::Value) -> Result<(), RuntimeError> {
        let _ = Self::from_params(value)?;
        Ok(())
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct SerialTransport {
    controller: SmolStr,
    writer: AsyncMutex<BoxedWriter>,
    connected: Arc<AtomicBool>,
    events: TransportEvents,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("controller", &self.controller)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SerialTransport {
    /// Open the configured serial device.
    #[cfg(feature = "serial-wire")]
    pub async fn open(
        controller: &ControllerConfig,
        events: TransportEvents,
    ) -> Result<Self, CommandError> {
        use tokio_serial::SerialPortBuilderExt;

        let config = SerialConfig::from_params(&controller.params).map_err(|err| {
            CommandError::Connect {
                controller: controller.id.clone(),
                message: err.to_string().into(),
            }
        })?;
        let stream = tokio_serial::new(&config.path, config.baud_rate)
            .open_native_async()
            .map_err(|err| CommandError::Connect {
                controller: controller.id.clone(),
                message: format!("{}: {err}", config.path).into(),
            })?;
        debug!(
            controller = %controller.id,
            path = %config.path,
            baud = config.baud_rate,
            "serial link open"
        );
        Ok(Self::from_stream(controller.id.clone(), stream, events))
    }

    #[cfg(not(feature = "serial-wire"))]
    pub async fn open(
        controller: &ControllerConfig,
        _events: TransportEvents,
    ) -> Result<Self, CommandError> {
        Err(CommandError::Connect {
            controller: controller.id.clone(),
            message: "serial support not built (enable the serial-wire feature)".into(),
        })
    }

    /// Run the line framing over any byte stream (serial port, pty, in-memory pipe).
    pub fn from_stream<S>(controller: SmolStr, stream: S, events: TransportEvents) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let connected = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_lines(
            controller.clone(),
            read_half,
            events.clone(),
            connected.clone(),
        ));
        Self {
            controller,
            writer: AsyncMutex::new(Box::new(write_half)),
            connected,
            events,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> &str {
        "serial"
    }

    fn send<'a>(&'a self, packet: &'a Packet) -> TransportFuture<'a, Result<(), CommandError>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(CommandError::Disconnected(self.controller.clone()));
            }
            let mut line = encode_line(packet);
            debug!(controller = %self.controller, id = packet.id, frame = %line, "serial tx");
            line.push('\n');
            let mut writer = self.writer.lock().await;
            let written = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                self.connected.store(false, Ordering::SeqCst);
                let message = SmolStr::new(format!("serial write: {err}"));
                let _ = self.events.send(TransportEvent::Error(message.clone()));
                return Err(CommandError::Transport {
                    controller: self.controller.clone(),
                    message,
                });
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.connected.store(false, Ordering::SeqCst);
            if let Some(reader) = self.reader.lock().take() {
                reader.abort();
            }
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn read_lines<R>(
    controller: SmolStr,
    read_half: R,
    events: TransportEvents,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!(controller = %controller, "serial stream closed");
                break;
            }
            Ok(_) => {
                // Boot noise at the wrong baud rate is not valid UTF-8.
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let message = classify_frame(text);
                if let InboundMessage::Log(line) = &message {
                    debug!(controller = %controller, line = %line, "firmware log");
                }
                if events.send(TransportEvent::Message(message)).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(controller = %controller, "serial read failed: {err}");
                let _ = events.send(TransportEvent::Error(
                    format!("serial read: {err}").into(),
                ));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TransportEvent::Closed);
}

/// Serialize a packet to one pipe-delimited line (without the terminator).
///
/// `CMD` is upper-cased; a `port`/`gpio` pair becomes a leading
/// `<port>_<gpio>` token; other fields follow in insertion order.
#[must_use]
pub fn encode_line(packet: &Packet) -> String {
    let mut line = packet.cmd.to_ascii_uppercase();
    let pin = pin_token(packet);
    if let Some(token) = &pin {
        line.push(FIELD_SEPARATOR);
        line.push_str(token);
    }
    for (key, value) in &packet.fields {
        if pin.is_some() && matches!(key.as_str(), "port" | "gpio") {
            continue;
        }
        line.push(FIELD_SEPARATOR);
        line.push_str(&encode_field(value));
    }
    line
}

fn pin_token(packet: &Packet) -> Option<String> {
    let port = packet.field("port")?;
    let gpio = packet.field("gpio")?;
    Some(format!("{}_{}", encode_field(port), encode_field(gpio)))
}

fn encode_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => String::from(if *flag { "1" } else { "0" }),
        Value::Number(number) => number.to_string(),
        Value::String(text) if text.contains(['|', '\n', '\r']) => value.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use serde_json::json;

    #[test]
    fn bare_keywords_have_no_separators() {
        expect!["PING"].assert_eq(&encode_line(&Packet::new("ping")));
        expect!["STATUS"].assert_eq(&encode_line(&Packet::new("status")));
    }

    #[test]
    fn pin_commands_lead_with_port_gpio_token() {
        let packet = Packet::new("digital_write").with("state", true).pin(1, 5);
        expect!["DIGITAL_WRITE|1_5|1"].assert_eq(&encode_line(&packet));
    }

    #[test]
    fn register_blocks_are_inlined_as_json() {
        let packet = Packet::new("modbus_read").with(
            "request",
            json!({"address": 3, "register": 0, "count": 2}),
        );
        expect![[r#"MODBUS_READ|{"address":3,"count":2,"register":0}"#]]
            .assert_eq(&encode_line(&packet));
    }

    #[test]
    fn strings_that_would_break_framing_are_quoted() {
        let packet = Packet::new("display").with("text", "a|b");
        expect![[r#"DISPLAY|"a|b""#]].assert_eq(&encode_line(&packet));
    }

    #[test]
    fn serial_params_accept_port_alias_and_default_baud() {
        let params: toml::Value = toml::from_str("port = \"/dev/ttyACM0\"").expect("params");
        let config = SerialConfig::from_params(&params).expect("config");
        assert_eq!(config.path, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 115_200);
    }

    #[test]
    fn serial_params_require_a_path() {
        let params: toml::Value = toml::from_str("baud_rate = 9600").expect("params");
        assert!(SerialConfig::from_params(&params).is_err());
    }
}
