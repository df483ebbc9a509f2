pub mod frame;
mod tls;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use frame::{FrameError, ReadFunction};
use types::{unix_ms, DeviceConfiguration, DeviceIdentity, Reading, DEFAULT_SCALE, FINE_SCALE};

pub const TELEMETRY_START: u16 = 0;
pub const TELEMETRY_REGISTERS: u16 = 7;
pub const CONFIGURATION_START: u16 = 0;
pub const CONFIGURATION_REGISTERS: u16 = DeviceConfiguration::REGISTER_COUNT as u16;

/// Trust settings for the encrypted channel.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// PEM bundle trusted in addition to the public web roots.
    pub ca_file: Option<String>,
    /// Overrides the name presented for SNI and certificate validation.
    pub server_name: Option<String>,
}

/// Connection settings for one device endpoint.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub slave_address: u8,
    /// Bounds the connect (handshake included) and every request/response exchange.
    pub timeout_ms: u64,
    /// Plain TCP when `None`.
    pub tls: Option<TlsConfig>,
    /// Optional pause between the single-register writes of a configuration upload.
    pub inter_write_delay_ms: Option<u64>,
}

impl ClientConfig {
    pub fn for_device(identity: &DeviceIdentity) -> Self {
        Self {
            host: identity.ip.clone(),
            port: identity.port,
            slave_address: identity.slave_address,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            slave_address: 1,
            timeout_ms: 2_000,
            tls: None,
            inter_write_delay_ms: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("tls error: {0}")]
    Tls(String),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("not connected")]
    NotConnected,
    #[error("malformed response: {0}")]
    Frame(#[from] FrameError),
    #[error("expected {expected} registers, got {actual}")]
    UnexpectedRegisterCount { expected: usize, actual: usize },
    #[error("response to {operation} does not echo the request")]
    UnexpectedResponse { operation: &'static str },
}

impl ClientError {
    /// True for failures detected while opening the connection.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ClientError::InvalidAddress(..) | ClientError::Connect { .. } | ClientError::Tls(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Operations the polling supervisor and the discovery scanner need from a device.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    /// Drops any existing connection, then opens a new one.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Idempotent; safe when already disconnected.
    async fn disconnect(&self);

    /// Last known transition, not a live health check.
    fn is_connected(&self) -> bool;

    async fn read_telemetry(&self) -> Result<Reading, ClientError>;

    async fn read_configuration(&self) -> Result<DeviceConfiguration, ClientError>;

    /// Writes registers 0..=8 in order and stops at the first failure. Registers
    /// already written keep their new values.
    async fn write_configuration(&self, config: &DeviceConfiguration) -> Result<(), ClientError>;
}

/// Creates clients for devices; lets callers substitute fakes.
pub trait ClientFactory: Send + Sync {
    fn create(&self, device_id: &str, config: ClientConfig) -> Arc<dyn DeviceClient>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpClientFactory;

impl ClientFactory for TcpClientFactory {
    fn create(&self, device_id: &str, config: ClientConfig) -> Arc<dyn DeviceClient> {
        Arc::new(ModbusClient::new(device_id, config))
    }
}

trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// One connection to one device. Exchanges are serialized by the link lock.
pub struct ModbusClient {
    device_id: String,
    config: ClientConfig,
    link: Mutex<Option<Box<dyn Link>>>,
    state: RwLock<ConnectionState>,
}

impl fmt::Debug for ModbusClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModbusClient")
            .field("device_id", &self.device_id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ModbusClient {
    pub fn new(device_id: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            device_id: device_id.into(),
            config,
            link: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|state| *state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    async fn open(&self) -> Result<Box<dyn Link>, ClientError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|_| ClientError::InvalidAddress(self.config.host.clone(), self.config.port))?;

        let attempt = async {
            let tcp = TcpStream::connect(addr)
                .await
                .map_err(|source| ClientError::Connect {
                    addr: addr.to_string(),
                    source,
                })?;
            tcp.set_nodelay(true)?;

            let link: Box<dyn Link> = match &self.config.tls {
                None => Box::new(tcp),
                Some(settings) => {
                    let connector = tls::connector(settings)?;
                    let name = tls::server_name(settings, &self.config.host)?;
                    let stream = connector
                        .connect(name, tcp)
                        .await
                        .map_err(|err| ClientError::Tls(err.to_string()))?;
                    Box::new(stream)
                }
            };
            Ok::<_, ClientError>(link)
        };

        match timeout(self.io_timeout(), attempt).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Connect {
                addr: addr.to_string(),
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection within {}ms", self.config.timeout_ms),
                ),
            }),
        }
    }

    async fn close(&self, link: &mut Option<Box<dyn Link>>) {
        if let Some(mut stream) = link.take() {
            if let Ok(Err(err)) = timeout(self.io_timeout(), stream.shutdown()).await {
                debug!(device_id = %self.device_id, error = %err, "shutdown on close failed");
            }
            info!(device_id = %self.device_id, host = %self.config.host, "disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Writes `request` and reads exactly `response_len` bytes. A timeout or a
    /// short read is reported as [`ClientError::Timeout`] and leaves the
    /// connection as it was. Bytes still buffered from an earlier exchange
    /// are discarded before the request goes out.
    pub async fn exchange(&self, request: &[u8], response_len: usize) -> Result<Vec<u8>, ClientError> {
        let mut link = self.link.lock().await;
        let stream = link.as_mut().ok_or(ClientError::NotConnected)?;
        let timeout_ms = self.config.timeout_ms;
        let device_id = self.device_id.as_str();

        let io = async {
            discard_stale(&mut **stream, device_id).await?;
            stream.write_all(request).await?;
            stream.flush().await?;
            let mut response = vec![0u8; response_len];
            stream.read_exact(&mut response).await?;
            Ok::<_, io::Error>(response)
        };

        match timeout(self.io_timeout(), io).await {
            Ok(Ok(response)) => {
                debug!(device_id = %self.device_id, sent = request.len(), received = response.len(), "exchange ok");
                Ok(response)
            }
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(ClientError::Timeout { timeout_ms })
            }
            Ok(Err(err)) => Err(ClientError::Io(err)),
            Err(_) => Err(ClientError::Timeout { timeout_ms }),
        }
    }

    /// Reads `count` registers and insists on getting exactly that many back.
    pub async fn read_registers(
        &self,
        function: ReadFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        let request = frame::build_read_request(function, self.config.slave_address, start, count);
        let response = self
            .exchange(&request, frame::read_response_len(count))
            .await?;
        let registers = frame::parse_registers(&response)?;
        if registers.len() != usize::from(count) {
            return Err(ClientError::UnexpectedRegisterCount {
                expected: usize::from(count),
                actual: registers.len(),
            });
        }
        Ok(registers)
    }

    pub async fn write_register(&self, address: u16, value: u16) -> Result<(), ClientError> {
        let request = frame::build_write_single_request(self.config.slave_address, address, value);
        let response = self
            .exchange(&request, frame::WRITE_RESPONSE_LEN)
            .await?;
        frame::check_frame(&response)?;
        if response[..frame::REQUEST_LEN - 2] != request[..frame::REQUEST_LEN - 2] {
            return Err(ClientError::UnexpectedResponse {
                operation: "write single register",
            });
        }
        debug!(device_id = %self.device_id, address, value, "register written");
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for ModbusClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let mut link = self.link.lock().await;
        self.close(&mut link).await;
        self.set_state(ConnectionState::Connecting);

        match self.open().await {
            Ok(stream) => {
                *link = Some(stream);
                self.set_state(ConnectionState::Connected);
                info!(
                    device_id = %self.device_id,
                    host = %self.config.host,
                    port = self.config.port,
                    tls = self.config.tls.is_some(),
                    "connected"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(device_id = %self.device_id, host = %self.config.host, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.close(&mut link).await;
    }

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    async fn read_telemetry(&self) -> Result<Reading, ClientError> {
        let registers = self
            .read_registers(ReadFunction::Input, TELEMETRY_START, TELEMETRY_REGISTERS)
            .await?;
        decode_telemetry(&self.device_id, unix_ms(), &registers)
    }

    async fn read_configuration(&self) -> Result<DeviceConfiguration, ClientError> {
        let registers = self
            .read_registers(ReadFunction::Holding, CONFIGURATION_START, CONFIGURATION_REGISTERS)
            .await?;
        DeviceConfiguration::from_registers(&registers).ok_or(ClientError::UnexpectedRegisterCount {
            expected: DeviceConfiguration::REGISTER_COUNT,
            actual: registers.len(),
        })
    }

    async fn write_configuration(&self, config: &DeviceConfiguration) -> Result<(), ClientError> {
        let registers = config.to_registers();
        for (offset, value) in registers.iter().enumerate() {
            let address = CONFIGURATION_START + offset as u16;
            if let Err(err) = self.write_register(address, *value).await {
                warn!(
                    device_id = %self.device_id,
                    address,
                    written = offset,
                    error = %err,
                    "configuration write aborted"
                );
                return Err(err);
            }
            if offset + 1 < registers.len() {
                if let Some(delay_ms) = self.config.inter_write_delay_ms {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
        info!(device_id = %self.device_id, "configuration written");
        Ok(())
    }
}

/// Reads and drops whatever is already buffered on the link without waiting.
/// A reply that arrived after its exchange timed out would otherwise be taken
/// as the answer to the next request and misalign every later frame.
async fn discard_stale(stream: &mut dyn Link, device_id: &str) -> io::Result<()> {
    let mut scratch = [0u8; 256];
    let mut discarded = 0usize;
    loop {
        // a zero timeout still polls the read once before giving up
        match timeout(Duration::ZERO, stream.read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(read)) => discarded += read,
            Ok(Err(err)) => return Err(err),
        }
    }
    if discarded > 0 {
        debug!(device_id, discarded, "dropped stale response bytes");
    }
    Ok(())
}

/// Maps the input register block positionally onto a [`Reading`].
pub fn decode_telemetry(device_id: &str, timestamp_ms: i64, registers: &[u16]) -> Result<Reading, ClientError> {
    let [solar_current, solar_voltage, output_voltage, internal_temp, panel_temp, aux_rail, output_current] =
        *registers
    else {
        return Err(ClientError::UnexpectedRegisterCount {
            expected: usize::from(TELEMETRY_REGISTERS),
            actual: registers.len(),
        });
    };

    Ok(Reading {
        device_id: device_id.to_string(),
        timestamp_ms,
        solar_voltage: frame::to_float(solar_voltage, DEFAULT_SCALE),
        solar_current: frame::to_float(solar_current, DEFAULT_SCALE),
        output_voltage: frame::to_float(output_voltage, DEFAULT_SCALE),
        output_current: frame::to_float(output_current, DEFAULT_SCALE),
        internal_temp_c: frame::to_float(internal_temp, DEFAULT_SCALE),
        panel_temp_c: frame::to_float(panel_temp, DEFAULT_SCALE),
        aux_rail_voltage: frame::to_float(aux_rail, FINE_SCALE),
    })
}
