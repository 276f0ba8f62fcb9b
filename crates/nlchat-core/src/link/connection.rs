//! Connection management
//!
//! Handles the lifecycle of the open channel: opening with settle delay,
//! reading whatever is ready, bounded writes and live line-setting changes.

use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    DataBits, FlowControl, LinkBuffer, LinkChannel, LinkError, LinkTransport, Parity,
    SerialConfig, StopBits, DEFAULT_BUFFER_SIZE, OPEN_SETTLE_DELAY, WRITE_TIMEOUT,
};

/// Size of a single read from the channel
const READ_CHUNK_SIZE: usize = 4096;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Port open and exchanging data
    Connected,
    /// Device lost, waiting for the next reconnect attempt
    Reconnecting,
}

/// A single (possibly closed) link to a device
pub struct Connection {
    transport: Box<dyn LinkTransport>,
    channel: Option<Box<dyn LinkChannel>>,
    state: ConnectionState,
    port_name: Option<String>,
    buffer: LinkBuffer,
    write_buffer_size: usize,
    read_chunk: Vec<u8>,
}

impl Connection {
    /// Create a closed connection that opens ports through `transport`
    pub fn new(transport: Box<dyn LinkTransport>) -> Self {
        Self {
            transport,
            channel: None,
            state: ConnectionState::Disconnected,
            port_name: None,
            buffer: LinkBuffer::default(),
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            read_chunk: vec![0u8; READ_CHUNK_SIZE],
        }
    }

    /// Open `port_name`, closing any current channel first.
    ///
    /// The receive buffer is recreated empty at the configured ceiling.
    pub async fn open(&mut self, port_name: &str, config: &SerialConfig) -> Result<(), LinkError> {
        self.close();
        self.buffer = LinkBuffer::with_capacity(config.read_buffer_size);
        self.write_buffer_size = config.write_buffer_size;
        self.port_name = Some(port_name.to_string());

        tokio::time::sleep(OPEN_SETTLE_DELAY).await;

        match self.transport.open(port_name, config) {
            Ok(mut channel) => {
                // Stale bytes from before the open are not part of this session
                if let Err(e) = channel.clear_input_buffer() {
                    tracing::debug!(port = port_name, "failed to clear input buffer: {e}");
                }
                self.channel = Some(channel);
                self.state = ConnectionState::Connected;
                tracing::info!(port = port_name, baud = config.baud_rate, "port opened");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(port = port_name, "open failed: {e}");
                Err(e)
            }
        }
    }

    /// Drop the channel. Returns whether a channel was actually open.
    pub fn close(&mut self) -> bool {
        self.state = ConnectionState::Disconnected;
        match self.channel.take() {
            Some(_) => {
                tracing::info!(port = self.port_name.as_deref().unwrap_or(""), "port closed");
                true
            }
            None => false,
        }
    }

    /// Whether a channel is open
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Mark a closed connection as waiting for a reconnect attempt
    pub fn mark_reconnecting(&mut self) {
        if !self.is_open() {
            self.state = ConnectionState::Reconnecting;
        }
    }

    /// Mark a closed connection as given up on
    pub fn mark_disconnected(&mut self) {
        if !self.is_open() {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Port most recently opened (or attempted)
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Wait until the channel has bytes and return them.
    ///
    /// Pends forever while closed. An empty result means end of stream.
    pub async fn read_ready(&mut self) -> io::Result<Vec<u8>> {
        let Some(channel) = self.channel.as_mut() else {
            return std::future::pending().await;
        };
        let n = channel.read(&mut self.read_chunk).await?;
        Ok(self.read_chunk[..n].to_vec())
    }

    /// Write an already framed packet, waiting at most [`WRITE_TIMEOUT`]
    /// for it to drain. Returns the number of bytes written.
    pub async fn write(&mut self, framed: &[u8]) -> Result<usize, LinkError> {
        let channel = self.channel.as_mut().ok_or(LinkError::NotOpen)?;
        if framed.len() > self.write_buffer_size {
            return Err(LinkError::WriteTooLarge {
                len: framed.len(),
                limit: self.write_buffer_size,
            });
        }

        let io = async {
            channel.write_all(framed).await?;
            channel.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, io).await {
            Ok(Ok(())) => Ok(framed.len()),
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => {
                tracing::warn!(len = framed.len(), "write did not drain in time");
                Err(LinkError::WriteTimeout)
            }
        }
    }

    /// Receive buffer
    pub fn buffer(&self) -> &LinkBuffer {
        &self.buffer
    }

    /// Receive buffer, mutable
    pub fn buffer_mut(&mut self) -> &mut LinkBuffer {
        &mut self.buffer
    }

    /// Change the baud rate if open
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> bool {
        self.apply("baud rate", |c| c.set_baud_rate(baud_rate))
    }

    /// Change the data bits if open
    pub fn set_data_bits(&mut self, data_bits: DataBits) -> bool {
        self.apply("data bits", |c| c.set_data_bits(data_bits))
    }

    /// Change the stop bits if open
    pub fn set_stop_bits(&mut self, stop_bits: StopBits) -> bool {
        self.apply("stop bits", |c| c.set_stop_bits(stop_bits))
    }

    /// Change the parity if open
    pub fn set_parity(&mut self, parity: Parity) -> bool {
        self.apply("parity", |c| c.set_parity(parity))
    }

    /// Change the flow control if open
    pub fn set_flow_control(&mut self, flow_control: FlowControl) -> bool {
        self.apply("flow control", |c| c.set_flow_control(flow_control))
    }

    /// Change the receive buffer ceiling if open
    pub fn set_read_buffer_size(&mut self, size: usize) -> bool {
        if !self.is_open() {
            tracing::debug!("read buffer size ignored, port not open");
            return false;
        }
        self.buffer.set_capacity(size);
        true
    }

    fn apply<F>(&mut self, what: &str, f: F) -> bool
    where
        F: FnOnce(&mut dyn LinkChannel) -> Result<(), LinkError>,
    {
        let Some(channel) = self.channel.as_mut() else {
            tracing::debug!("{what} ignored, port not open");
            return false;
        };
        match f(&mut **channel) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("failed to change {what}: {e}");
                false
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("port_name", &self.port_name)
            .field("state", &self.state)
            .field("open", &self.is_open())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
