//! In-memory link
//!
//! A transport and port inventory that need no hardware. Each open hands the
//! session one end of an in-process pipe and queues the other end as a
//! [`MemoryDevice`], which plays the role of the adapter. Used for demo mode
//! and for exercising the session in tests.

use std::collections::BTreeSet;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use super::{
    DataBits, FlowControl, LinkChannel, LinkError, LinkTransport, Parity, PortInfo,
    PortInventory, SerialConfig, StopBits, CH34X_PRODUCT_IDS, CH34X_VENDOR_ID,
};

/// Default pipe capacity in each direction
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Shared {
    plugged: BTreeSet<String>,
    line_settings: Option<SerialConfig>,
    open_attempts: u32,
}

/// Transport whose ports exist only in memory.
///
/// Clones share the same set of plugged ports.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    devices: mpsc::UnboundedSender<MemoryDevice>,
    pipe_capacity: usize,
}

/// Receives the device side of every channel the transport opens
pub struct MemoryDevices {
    incoming: mpsc::UnboundedReceiver<MemoryDevice>,
}

/// Device end of an open in-memory channel
pub struct MemoryDevice {
    port_name: String,
    stream: DuplexStream,
    shared: Arc<Mutex<Shared>>,
}

/// Session end of an open in-memory channel
struct MemoryChannel {
    stream: DuplexStream,
    shared: Arc<Mutex<Shared>>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryTransport {
    /// New transport with no ports plugged in
    pub fn new() -> (Self, MemoryDevices) {
        Self::with_pipe_capacity(DEFAULT_PIPE_CAPACITY)
    }

    /// New transport whose pipes buffer at most `capacity` bytes per direction
    pub fn with_pipe_capacity(capacity: usize) -> (Self, MemoryDevices) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            devices: tx,
            pipe_capacity: capacity.max(1),
        };
        (transport, MemoryDevices { incoming: rx })
    }

    /// Make a CH340 adapter appear at `port_name`
    pub fn plug(&self, port_name: impl Into<String>) {
        lock(&self.shared).plugged.insert(port_name.into());
    }

    /// Remove the adapter at `port_name`. Open channels stay up until the
    /// device end is dropped.
    pub fn unplug(&self, port_name: &str) {
        lock(&self.shared).plugged.remove(port_name);
    }

    /// Line settings of the most recently opened channel
    pub fn line_settings(&self) -> Option<SerialConfig> {
        lock(&self.shared).line_settings.clone()
    }

    /// Number of open calls so far, successful or not
    pub fn open_attempts(&self) -> u32 {
        lock(&self.shared).open_attempts
    }
}

impl LinkTransport for MemoryTransport {
    fn open(
        &mut self,
        port_name: &str,
        config: &SerialConfig,
    ) -> Result<Box<dyn LinkChannel>, LinkError> {
        {
            let mut shared = lock(&self.shared);
            shared.open_attempts += 1;
            if !shared.plugged.contains(port_name) {
                return Err(LinkError::Open {
                    port: port_name.to_string(),
                    reason: "device not found".to_string(),
                });
            }
            shared.line_settings = Some(config.clone());
        }

        let (host, device) = tokio::io::duplex(self.pipe_capacity);
        let device = MemoryDevice {
            port_name: port_name.to_string(),
            stream: device,
            shared: Arc::clone(&self.shared),
        };
        if self.devices.send(device).is_err() {
            tracing::debug!(port = port_name, "no one is accepting memory devices");
        }
        Ok(Box::new(MemoryChannel {
            stream: host,
            shared: Arc::clone(&self.shared),
        }))
    }
}

impl PortInventory for MemoryTransport {
    fn available_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        Ok(lock(&self.shared)
            .plugged
            .iter()
            .map(|name| PortInfo {
                manufacturer: Some("wch.cn".to_string()),
                product: Some("USB Serial".to_string()),
                ..PortInfo::usb(name.clone(), CH34X_VENDOR_ID, CH34X_PRODUCT_IDS[0])
            })
            .collect())
    }
}

impl MemoryDevices {
    /// Wait for the next channel to be opened
    pub async fn accept(&mut self) -> Option<MemoryDevice> {
        self.incoming.recv().await
    }
}

impl MemoryDevice {
    /// Port this device is attached to
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Send bytes to the session
    pub async fn send(&mut self, bytes: &[u8]) {
        if let Err(e) = self.stream.write_all(bytes).await {
            tracing::debug!(port = %self.port_name, "memory device write failed: {e}");
        }
    }

    /// Wait for bytes from the session. Empty once the session side closed.
    pub async fn read_available(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        match self.stream.read(&mut buf).await {
            Ok(n) => {
                buf.truncate(n);
                buf
            }
            Err(_) => Vec::new(),
        }
    }

    /// Pull the cable: the port disappears and the session sees end of stream
    pub fn unplug(self) {
        lock(&self.shared).plugged.remove(&self.port_name);
    }
}

impl MemoryChannel {
    fn update(&self, f: impl FnOnce(&mut SerialConfig)) {
        if let Some(settings) = lock(&self.shared).line_settings.as_mut() {
            f(settings);
        }
    }
}

impl AsyncRead for MemoryChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryChannel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl LinkChannel for MemoryChannel {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError> {
        self.update(|s| s.baud_rate = baud_rate);
        Ok(())
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), LinkError> {
        self.update(|s| s.data_bits = data_bits);
        Ok(())
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), LinkError> {
        self.update(|s| s.stop_bits = stop_bits);
        Ok(())
    }

    fn set_parity(&mut self, parity: Parity) -> Result<(), LinkError> {
        self.update(|s| s.parity = parity);
        Ok(())
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), LinkError> {
        self.update(|s| s.flow_control = flow_control);
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}
