//! Duplex byte channels
//!
//! The session never touches a device directly. It asks a [`LinkTransport`]
//! to open a [`LinkChannel`], reads from it when bytes are ready and writes
//! framed packets to it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use super::{DataBits, FlowControl, LinkError, Parity, SerialConfig, StopBits};

/// Open duplex connection to a device
pub trait LinkChannel: AsyncRead + AsyncWrite + Unpin + Send {
    /// Change the baud rate of the open line
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError>;

    /// Change the data bits of the open line
    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), LinkError>;

    /// Change the stop bits of the open line
    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), LinkError>;

    /// Change the parity of the open line
    fn set_parity(&mut self, parity: Parity) -> Result<(), LinkError>;

    /// Change the flow control of the open line
    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), LinkError>;

    /// Discard bytes the driver has received but nobody has read
    fn clear_input_buffer(&mut self) -> Result<(), LinkError>;
}

/// Opens channels to named ports
pub trait LinkTransport: Send {
    /// Open `port_name` read/write with the line settings from `config`
    fn open(
        &mut self,
        port_name: &str,
        config: &SerialConfig,
    ) -> Result<Box<dyn LinkChannel>, LinkError>;
}

/// Serial port wrapper implementing LinkChannel
pub struct SerialChannel {
    stream: SerialStream,
}

impl SerialChannel {
    /// Wrap an already opened stream
    pub fn new(stream: SerialStream) -> Self {
        Self { stream }
    }
}

impl AsyncRead for SerialChannel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for SerialChannel {
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

impl LinkChannel for SerialChannel {
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<(), LinkError> {
        Ok(self.stream.set_baud_rate(baud_rate)?)
    }

    fn set_data_bits(&mut self, data_bits: DataBits) -> Result<(), LinkError> {
        Ok(self.stream.set_data_bits(data_bits.into())?)
    }

    fn set_stop_bits(&mut self, stop_bits: StopBits) -> Result<(), LinkError> {
        Ok(self.stream.set_stop_bits(stop_bits.try_into()?)?)
    }

    fn set_parity(&mut self, parity: Parity) -> Result<(), LinkError> {
        Ok(self.stream.set_parity(parity.try_into()?)?)
    }

    fn set_flow_control(&mut self, flow_control: FlowControl) -> Result<(), LinkError> {
        Ok(self.stream.set_flow_control(flow_control.into())?)
    }

    fn clear_input_buffer(&mut self) -> Result<(), LinkError> {
        Ok(self.stream.clear(serialport::ClearBuffer::Input)?)
    }
}

/// Transport opening real serial ports through tokio-serial.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialTransport;

impl LinkTransport for SerialTransport {
    fn open(
        &mut self,
        port_name: &str,
        config: &SerialConfig,
    ) -> Result<Box<dyn LinkChannel>, LinkError> {
        let open_error = |reason: String| LinkError::Open {
            port: port_name.to_string(),
            reason,
        };

        let stop_bits = serialport::StopBits::try_from(config.stop_bits)
            .map_err(|e| open_error(e.to_string()))?;
        let parity =
            serialport::Parity::try_from(config.parity).map_err(|e| open_error(e.to_string()))?;

        let stream = tokio_serial::new(port_name, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(config.flow_control.into())
            .open_native_async()
            .map_err(|e| open_error(describe_open_error(&e)))?;

        tracing::debug!(
            port = port_name,
            baud = config.baud_rate,
            data_bits = config.data_bits.count(),
            stop_bits = %config.stop_bits,
            parity = %config.parity,
            flow = %config.flow_control,
            "serial port opened"
        );
        Ok(Box::new(SerialChannel::new(stream)))
    }
}

fn describe_open_error(e: &serialport::Error) -> String {
    match e.kind() {
        serialport::ErrorKind::NoDevice => format!("device not found or busy ({})", e),
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            format!("permission denied ({})", e)
        }
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            format!("device not found ({})", e)
        }
        serialport::ErrorKind::InvalidInput => format!("invalid port settings ({})", e),
        _ => e.to_string(),
    }
}
