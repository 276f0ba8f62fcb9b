//! Serial Link Session
//!
//! Owns a single CH34x serial connection and turns its byte stream into
//! discrete packets.
//!
//! Supports newline-delimited line mode and marker-delimited package mode,
//! hotplug detection by polling, and bounded automatic reconnection.

mod buffer;
pub mod channel;
mod codec;
pub mod config;
mod connection;
mod error;
mod memory;
mod reconnect;
pub mod serial;
mod session;
mod statistics;

pub use buffer::LinkBuffer;
pub use channel::{LinkChannel, LinkTransport, SerialChannel, SerialTransport};
pub use codec::{locale_fallback_encoding, FrameCodec};
pub use config::{DataBits, FlowControl, FramingMode, Parity, SerialConfig, StopBits};
pub use connection::{Connection, ConnectionState};
pub use error::LinkError;
pub use memory::{MemoryDevice, MemoryDevices, MemoryTransport};
pub use reconnect::{ReconnectStep, ReconnectSupervisor};
pub use serial::{
    chip_name, is_supported_device, DeviceEnumerator, PortInfo, PortInventory, SystemPorts,
};
pub use session::{SessionEvent, SessionHandle, SessionManager};
pub use statistics::Statistics;

use std::time::Duration;

/// WCH vendor id shared by every CH34x adapter
pub const CH34X_VENDOR_ID: u16 = 0x1a86;

/// Supported product ids: CH340, CH340K/CH343, CH341, CH330
pub const CH34X_PRODUCT_IDS: [u16; 4] = [0x7523, 0x7522, 0x5523, 0xE523];

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default receive/transmit buffer ceiling (10 MiB)
pub const DEFAULT_BUFFER_SIZE: usize = 10 * 1024 * 1024;

/// How often the port inventory is re-read for hotplug detection
pub const PORT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Delay between configuring a port and opening it, lets the adapter settle
pub const OPEN_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Upper bound on waiting for a write to drain
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default delay between reconnect attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Default number of reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Default package-mode inactivity timeout
pub const DEFAULT_PACKAGE_TIMEOUT: Duration = Duration::from_millis(1000);
