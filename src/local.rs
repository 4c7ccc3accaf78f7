//! Local Modbus-TCP transport.
//!
//! One physical connection serves every device behind it (e.g. several
//! inverters on one gateway). The wire protocol allows a single transaction
//! at a time, so every chunk operation takes the connection lock first. The
//! lock guard lives inside the operation's future: a caller that cancels the
//! future releases the connection with it.
//!
//! Each transaction is bounded by exactly one timeout, applied here. The
//! underlying `tokio-modbus` context has none of its own.

use crate::{
    error::{Error, Result},
    planner::Chunk,
    register::RegisterKind,
    transport::{DeviceAddress, RawRegisterBlock, Transport, TransportCapabilities},
};
use async_trait::async_trait;
use std::{fmt, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};

/// Registers per Modbus request accepted by the devices.
pub const LOCAL_MAX_CHUNK: u16 = 40;

/// Register access on one physical connection.
///
/// Implemented for [`tokio_modbus::client::Context`]; tests plug in mocks.
#[async_trait]
pub trait RegisterIo: Send {
    async fn read_registers(
        &mut self,
        unit_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> tokio_modbus::Result<Vec<u16>>;

    async fn write_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> tokio_modbus::Result<()>;
}

#[async_trait]
impl RegisterIo for tokio_modbus::client::Context {
    async fn read_registers(
        &mut self,
        unit_id: u8,
        kind: RegisterKind,
        address: u16,
        count: u16,
    ) -> tokio_modbus::Result<Vec<u16>> {
        self.set_slave(Slave(unit_id));
        match kind {
            RegisterKind::Input => self.read_input_registers(address, count).await,
            RegisterKind::Holding => self.read_holding_registers(address, count).await,
        }
    }

    async fn write_registers(
        &mut self,
        unit_id: u8,
        address: u16,
        values: &[u16],
    ) -> tokio_modbus::Result<()> {
        self.set_slave(Slave(unit_id));
        match values {
            [single] => self.write_single_register(address, *single).await,
            _ => self.write_multiple_registers(address, values).await,
        }
    }
}

/// Maps a tokio-modbus result to the crate result.
fn map_modbus_result<T>(result: tokio_modbus::Result<T>) -> Result<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(Error::ModbusException(exception.to_string())),
        Err(tokio_modbus::Error::Protocol(err)) => Err(Error::ProtocolDecode(err.to_string())),
        Err(tokio_modbus::Error::Transport(err))
            if err.kind() == std::io::ErrorKind::InvalidData =>
        {
            Err(Error::ProtocolDecode(err.to_string()))
        }
        Err(tokio_modbus::Error::Transport(err)) => {
            Err(Error::TransientCommunication(err.to_string()))
        }
    }
}

/// [`Transport`] over a single Modbus-TCP connection.
pub struct LocalTransport<C> {
    conn: Arc<Mutex<C>>,
    timeout: Duration,
    timeout_retries: u32,
}

impl<C> Clone for LocalTransport<C> {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            timeout: self.timeout,
            timeout_retries: self.timeout_retries,
        }
    }
}

impl<C> fmt::Debug for LocalTransport<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("timeout", &self.timeout)
            .field("timeout_retries", &self.timeout_retries)
            .finish_non_exhaustive()
    }
}

impl<C: RegisterIo> LocalTransport<C> {
    /// Wraps a connection. `timeout` bounds each transaction, a timed out read
    /// is attempted `timeout_retries` more times.
    pub fn new(conn: C, timeout: Duration, timeout_retries: u32) -> Self {
        Self::from_shared(Arc::new(Mutex::new(conn)), timeout, timeout_retries)
    }

    /// Uses a connection that is already shared with other users.
    pub fn from_shared(conn: Arc<Mutex<C>>, timeout: Duration, timeout_retries: u32) -> Self {
        Self {
            conn,
            timeout,
            timeout_retries,
        }
    }

    /// Returns a clone of the Arc-wrapped, Mutex-guarded connection.
    ///
    /// Holding the lock blocks every device on the connection.
    pub fn clone_shared(&self) -> Arc<Mutex<C>> {
        self.conn.clone()
    }

    /// One read transaction under the connection lock and the timeout.
    ///
    /// `Ok(None)` means the transaction timed out.
    async fn read_once(&self, unit_id: u8, chunk: Chunk) -> Result<Option<Vec<u16>>> {
        let mut conn = self.conn.lock().await;
        let request = conn.read_registers(unit_id, chunk.kind, chunk.start_address, chunk.count);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => map_modbus_result(result).map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn write_once(&self, unit_id: u8, chunk: Chunk, values: &[u16]) -> Result<Option<()>> {
        let mut conn = self.conn.lock().await;
        let request = conn.write_registers(unit_id, chunk.start_address, values);
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => map_modbus_result(result).map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(feature = "tokio-tcp")]
impl LocalTransport<tokio_modbus::client::Context> {
    /// Opens the Modbus-TCP connection.
    pub async fn connect(
        socket_addr: std::net::SocketAddr,
        timeout: Duration,
        timeout_retries: u32,
    ) -> Result<Self> {
        let ctx = tokio::time::timeout(timeout, tokio_modbus::client::tcp::connect(socket_addr))
            .await
            .map_err(|_| {
                Error::TransientCommunication(format!("connecting to {socket_addr} timed out"))
            })?
            .map_err(|e| {
                Error::TransientCommunication(format!("connecting to {socket_addr}: {e}"))
            })?;
        Ok(Self::new(ctx, timeout, timeout_retries))
    }
}

#[async_trait]
impl<C: RegisterIo + 'static> Transport for LocalTransport<C> {
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            max_chunk_size: LOCAL_MAX_CHUNK,
            supports_write: true,
            is_local: true,
            concurrent_reads: false,
            record_endpoints: false,
        }
    }

    async fn read_chunk(&self, device: &DeviceAddress, chunk: Chunk) -> Result<RawRegisterBlock> {
        if chunk.count > LOCAL_MAX_CHUNK {
            return Err(Error::Unsupported("chunks above the Modbus request ceiling"));
        }
        let attempts = self.timeout_retries + 1;
        for attempt in 1..=attempts {
            match self.read_once(device.unit_id, chunk).await? {
                Some(words) => return RawRegisterBlock::new(chunk, words),
                None => {
                    log::warn!("{device}: read of {chunk} timed out (attempt {attempt}/{attempts})")
                }
            }
        }
        Err(Error::DeviceUnreachable {
            serial: device.serial.clone(),
            attempts,
        })
    }

    async fn write_chunk(
        &self,
        device: &DeviceAddress,
        chunk: Chunk,
        values: &[u16],
    ) -> Result<()> {
        if chunk.kind != RegisterKind::Holding {
            return Err(Error::Unsupported("writes to input registers"));
        }
        if values.len() != usize::from(chunk.count) || chunk.count > LOCAL_MAX_CHUNK {
            return Err(Error::ProtocolDecode(format!(
                "{} value(s) for {chunk}",
                values.len()
            )));
        }
        let outcome = self.write_once(device.unit_id, chunk, values).await?;
        outcome.ok_or_else(|| {
            Error::TransientCommunication(format!(
                "{device}: write of {chunk} timed out, not retried"
            ))
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::{HashMap, HashSet};
    use tokio_modbus::ExceptionCode;

    /// In-memory devices keyed by unit id. Units listed in `hanging` never
    /// answer, units in `failing` answer with an exception.
    #[derive(Debug, Default)]
    pub(crate) struct MockConnection {
        pub registers: HashMap<(u8, RegisterKind, u16), u16>,
        pub hanging: HashSet<u8>,
        pub failing: HashSet<u8>,
        pub short_reply: bool,
        pub latency: Duration,
        pub reads: Vec<(u8, Chunk)>,
        pub writes: Vec<(u8, u16, Vec<u16>)>,
    }

    impl MockConnection {
        pub(crate) fn set(
            &mut self,
            unit_id: u8,
            kind: RegisterKind,
            address: u16,
            words: &[u16],
        ) {
            for (offset, word) in words.iter().enumerate() {
                self.registers.insert((unit_id, kind, address + offset as u16), *word);
            }
        }
    }

    #[async_trait]
    impl RegisterIo for MockConnection {
        async fn read_registers(
            &mut self,
            unit_id: u8,
            kind: RegisterKind,
            address: u16,
            count: u16,
        ) -> tokio_modbus::Result<Vec<u16>> {
            self.reads.push((unit_id, Chunk::new(kind, address, count)));
            if self.hanging.contains(&unit_id) {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.latency).await;
            if self.failing.contains(&unit_id) {
                return Ok(Err(ExceptionCode::IllegalDataAddress));
            }
            let count = if self.short_reply { count - 1 } else { count };
            Ok(Ok((address..address + count)
                .map(|a| self.registers.get(&(unit_id, kind, a)).copied().unwrap_or(0))
                .collect()))
        }

        async fn write_registers(
            &mut self,
            unit_id: u8,
            address: u16,
            values: &[u16],
        ) -> tokio_modbus::Result<()> {
            if self.hanging.contains(&unit_id) {
                std::future::pending::<()>().await;
            }
            self.writes.push((unit_id, address, values.to_vec()));
            self.set(unit_id, RegisterKind::Holding, address, values);
            Ok(Ok(()))
        }
    }

    fn transport(conn: MockConnection) -> LocalTransport<MockConnection> {
        LocalTransport::new(conn, Duration::from_secs(2), 2)
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_reported_unreachable() {
        let mut conn = MockConnection::default();
        conn.hanging.insert(1);
        let transport = transport(conn);
        let start = tokio::time::Instant::now();

        let err = transport
            .read_chunk(&DeviceAddress::new("A", 1), Chunk::new(RegisterKind::Input, 0, 10))
            .await
            .unwrap_err();

        assert_matches!(err, Error::DeviceUnreachable { attempts: 3, .. });
        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(transport.clone_shared().lock().await.reads.len(), 3);
    }

    #[tokio::test]
    async fn exceptions_and_short_replies_are_not_retried() {
        let mut conn = MockConnection::default();
        conn.failing.insert(1);
        let transport = transport(conn);
        let chunk = Chunk::new(RegisterKind::Holding, 0, 4);
        assert_matches!(
            transport.read_chunk(&DeviceAddress::new("A", 1), chunk).await,
            Err(Error::ModbusException(_))
        );
        assert_eq!(transport.clone_shared().lock().await.reads.len(), 1);

        let transport = LocalTransport::new(
            MockConnection {
                short_reply: true,
                ..Default::default()
            },
            Duration::from_secs(2),
            2,
        );
        assert_matches!(
            transport.read_chunk(&DeviceAddress::new("A", 1), chunk).await,
            Err(Error::ProtocolDecode(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_read_releases_the_connection() {
        let mut conn = MockConnection::default();
        conn.hanging.insert(1);
        conn.set(2, RegisterKind::Input, 0, &[7, 8]);
        let transport = LocalTransport::new(conn, Duration::from_secs(60), 0);
        let chunk = Chunk::new(RegisterKind::Input, 0, 2);

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            transport.read_chunk(&DeviceAddress::new("A", 1), chunk),
        )
        .await;
        assert!(cancelled.is_err());

        let block = tokio::time::timeout(
            Duration::from_secs(1),
            transport.read_chunk(&DeviceAddress::new("B", 2), chunk),
        )
        .await
        .expect("connection lock was not released")
        .unwrap();
        assert_eq!(block.words(), &[7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn devices_sharing_a_connection_are_serialized() {
        let conn = MockConnection {
            latency: Duration::from_millis(100),
            ..Default::default()
        };
        let transport = transport(conn);
        let devices: Vec<_> = (1..=4)
            .map(|unit| DeviceAddress::new(format!("D{unit}"), unit))
            .collect();
        let start = tokio::time::Instant::now();

        let reads = devices
            .iter()
            .map(|device| transport.read_chunk(device, Chunk::new(RegisterKind::Input, 0, 1)));
        futures::future::try_join_all(reads).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn writes_go_to_the_holding_table() {
        let transport = transport(MockConnection::default());
        let device = DeviceAddress::new("A", 3);
        transport
            .write_chunk(&device, Chunk::new(RegisterKind::Holding, 64, 2), &[50, 60])
            .await
            .unwrap();
        assert_eq!(
            transport.clone_shared().lock().await.writes,
            vec![(3, 64, vec![50, 60])]
        );
        assert_matches!(
            transport
                .write_chunk(&device, Chunk::new(RegisterKind::Input, 0, 1), &[1])
                .await,
            Err(Error::Unsupported(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_write_is_not_retried() {
        let mut conn = MockConnection::default();
        conn.hanging.insert(1);
        let transport = transport(conn);
        let err = transport
            .write_chunk(
                &DeviceAddress::new("A", 1),
                Chunk::new(RegisterKind::Holding, 21, 1),
                &[1],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::TransientCommunication(_));
    }
}
