//! Session management
//!
//! One tokio task owns the connection, codec, reconnect supervisor and
//! statistics. Front-ends talk to it through a cloneable [`SessionHandle`]
//! and observe it through a single ordered stream of [`SessionEvent`]s.
//!
//! The task waits on five sources at once:
//! - commands from handles
//! - bytes ready on the open channel
//! - the port inventory poll (every 2 s for the life of the session)
//! - the reconnect deadline
//! - the package inactivity deadline
//!
//! Deadlines are plain values cleared on close, so nothing fires against a
//! closed or reopened link.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    Connection, ConnectionState, DataBits, DeviceEnumerator, FlowControl, FrameCodec,
    FramingMode, LinkError, LinkTransport, Parity, PortInventory, ReconnectStep,
    ReconnectSupervisor, SerialConfig, SerialTransport, Statistics, StopBits, SystemPorts,
    PORT_POLL_INTERVAL,
};

/// Depth of the command queue between handles and the session task
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Notification from the session, delivered in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A complete packet was decoded
    PacketReceived(Vec<u8>),
    /// Something went wrong, in user-facing words
    Error(String),
    /// The set of attached adapters changed
    PortsChanged,
    /// Statistics changed
    StatisticsUpdated(Statistics),
    /// A reconnect attempt is starting
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Attempts allowed
        max: u32,
    },
    /// Partial package data sat in the buffer for the whole timeout
    PackageTimeout,
    /// The connection state changed
    StateChanged(ConnectionState),
}

/// Live line setting change
#[derive(Debug, Clone, Copy)]
enum LineSetting {
    BaudRate(u32),
    DataBits(DataBits),
    StopBits(StopBits),
    Parity(Parity),
    FlowControl(FlowControl),
    ReadBufferSize(usize),
}

enum Command {
    Open {
        port: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    IsOpen {
        reply: oneshot::Sender<bool>,
    },
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<usize, LinkError>>,
    },
    ListDevices {
        reply: oneshot::Sender<Result<Vec<String>, LinkError>>,
    },
    ApplyConfig {
        config: Box<SerialConfig>,
        reply: oneshot::Sender<Result<bool, LinkError>>,
    },
    CurrentConfig {
        reply: oneshot::Sender<SerialConfig>,
    },
    Statistics {
        reply: oneshot::Sender<Statistics>,
    },
    ResetStatistics {
        reply: oneshot::Sender<()>,
    },
    SetAutoReconnect {
        enabled: bool,
        interval: Duration,
        max_attempts: u32,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    SetPackageMode {
        framing: Result<FramingMode, LinkError>,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Configure {
        setting: LineSetting,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owner of one serial link, run as a background task
pub struct SessionManager {
    config: SerialConfig,
    codec: FrameCodec,
    connection: Connection,
    enumerator: DeviceEnumerator,
    supervisor: ReconnectSupervisor,
    statistics: Statistics,
    last_port: Option<String>,
    package_deadline: Option<Instant>,
    reported_state: ConnectionState,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    /// Start a session task on the current tokio runtime.
    ///
    /// Ports are opened through `transport` and hotplug is detected by
    /// polling `inventory`. The task ends when every handle is dropped or
    /// [`SessionHandle::shutdown`] is called.
    pub fn spawn(
        transport: Box<dyn LinkTransport>,
        inventory: Box<dyn PortInventory>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let config = SerialConfig::default();
        let manager = SessionManager {
            codec: FrameCodec::from_config(&config),
            supervisor: ReconnectSupervisor::from_config(&config),
            config,
            connection: Connection::new(transport),
            enumerator: DeviceEnumerator::new(inventory),
            statistics: Statistics::new(),
            last_port: None,
            package_deadline: None,
            reported_state: ConnectionState::Disconnected,
            events: event_tx,
        };
        tokio::spawn(manager.run(command_rx));

        (
            SessionHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Start a session on the host's real serial ports
    pub fn spawn_system() -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        Self::spawn(Box::new(SerialTransport), Box::new(SystemPorts))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut poll =
            tokio::time::interval_at(Instant::now() + PORT_POLL_INTERVAL, PORT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::debug!("session started");
        loop {
            let reconnect_at = self.supervisor.deadline();
            let package_at = self.package_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        self.close();
                        break;
                    }
                },
                read = self.connection.read_ready() => self.on_read(read),
                _ = poll.tick() => self.poll_ports(),
                _ = sleep_until(reconnect_at) => self.on_reconnect_due().await,
                _ = sleep_until(package_at) => self.on_package_timeout(),
            }
        }
        tracing::debug!("session stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Open { port, reply } => {
                let result = self.open(&port).await;
                let _ = reply.send(result);
            }
            Command::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
            Command::IsOpen { reply } => {
                let _ = reply.send(self.connection.is_open());
            }
            Command::State { reply } => {
                let _ = reply.send(self.connection.state());
            }
            Command::Write { data, reply } => {
                let result = self.write(&data).await;
                let _ = reply.send(result);
            }
            Command::ListDevices { reply } => {
                let _ = reply.send(self.enumerator.list_devices());
            }
            Command::ApplyConfig { config, reply } => {
                let result = self.apply_config(*config).await;
                let _ = reply.send(result);
            }
            Command::CurrentConfig { reply } => {
                let _ = reply.send(self.config.clone());
            }
            Command::Statistics { reply } => {
                let _ = reply.send(self.statistics.clone());
            }
            Command::ResetStatistics { reply } => {
                self.statistics.reset();
                self.emit_statistics();
                let _ = reply.send(());
            }
            Command::SetAutoReconnect {
                enabled,
                interval,
                max_attempts,
                reply,
            } => {
                let result = self.set_auto_reconnect(enabled, interval, max_attempts);
                let _ = reply.send(result);
            }
            Command::SetPackageMode { framing, reply } => {
                let result = framing.map(|framing| self.set_framing(framing));
                let _ = reply.send(result);
            }
            Command::Configure { setting, reply } => {
                let _ = reply.send(self.configure(setting));
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn open(&mut self, port: &str) -> Result<(), LinkError> {
        // An explicit open supersedes any pending reconnect
        self.supervisor.disarm();
        self.package_deadline = None;
        self.last_port = Some(port.to_string());

        let result = self.connection.open(port, &self.config).await;
        if let Err(e) = &result {
            self.surface_error(e);
        }
        self.report_state();
        result
    }

    fn close(&mut self) {
        self.supervisor.disarm();
        self.package_deadline = None;
        self.connection.close();
        self.report_state();
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        if !self.connection.is_open() {
            let e = LinkError::NotOpen;
            self.surface_error(&e);
            return Err(e);
        }

        let framed = self.codec.encode(data);
        match self.connection.write(&framed).await {
            Ok(written) => {
                tracing::debug!(bytes = written, "packet sent");
                self.statistics.record_sent(written);
                self.emit_statistics();
                Ok(written)
            }
            Err(LinkError::Io(e)) if !is_benign(&e) => {
                let reason = e.to_string();
                self.on_resource_lost(&reason);
                Err(LinkError::Io(e))
            }
            Err(e) => {
                self.surface_error(&e);
                Err(e)
            }
        }
    }

    async fn apply_config(&mut self, config: SerialConfig) -> Result<bool, LinkError> {
        if let Err(e) = config.validate() {
            tracing::warn!("configuration rejected: {e}");
            return Err(e);
        }

        self.close();
        self.codec = FrameCodec::from_config(&config);
        self.supervisor.configure(
            config.auto_reconnect,
            config.reconnect_interval,
            config.max_reconnect_attempts,
        );
        self.config = config;
        tracing::info!(
            port = %self.config.port_name,
            baud = self.config.baud_rate,
            package = self.config.framing.is_package(),
            "configuration applied"
        );

        if self.config.port_name.is_empty() {
            return Ok(false);
        }
        let port = self.config.port_name.clone();
        self.open(&port).await.map(|()| true)
    }

    fn set_auto_reconnect(
        &mut self,
        enabled: bool,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<(), LinkError> {
        let mut config = self.config.clone();
        config.auto_reconnect = enabled;
        config.reconnect_interval = interval;
        config.max_reconnect_attempts = max_attempts;
        if let Err(e) = config.validate() {
            tracing::warn!("reconnect policy rejected: {e}");
            return Err(e);
        }

        self.config = config;
        self.supervisor.configure(enabled, interval, max_attempts);
        if !self.supervisor.is_armed() {
            self.connection.mark_disconnected();
            self.report_state();
        }
        Ok(())
    }

    fn set_framing(&mut self, framing: FramingMode) {
        tracing::debug!(package = framing.is_package(), "framing changed");
        if !framing.is_package() {
            self.package_deadline = None;
        }
        self.config.framing = framing;
        self.codec = FrameCodec::from_config(&self.config);
    }

    fn configure(&mut self, setting: LineSetting) -> bool {
        match setting {
            LineSetting::BaudRate(v) => self.connection.set_baud_rate(v),
            LineSetting::DataBits(v) => self.connection.set_data_bits(v),
            LineSetting::StopBits(v) => self.connection.set_stop_bits(v),
            LineSetting::Parity(v) => self.connection.set_parity(v),
            LineSetting::FlowControl(v) => self.connection.set_flow_control(v),
            LineSetting::ReadBufferSize(v) => self.connection.set_read_buffer_size(v),
        }
    }

    fn on_read(&mut self, read: io::Result<Vec<u8>>) {
        match read {
            Ok(bytes) if bytes.is_empty() => self.on_resource_lost("end of stream"),
            Ok(bytes) => self.ingest(&bytes),
            Err(e) if is_benign(&e) => tracing::trace!("ignoring read error: {e}"),
            Err(e) => self.on_resource_lost(&e.to_string()),
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        self.statistics.record_received(bytes.len());
        self.emit_statistics();

        self.connection.buffer_mut().append(bytes);
        let packets = self.codec.decode(self.connection.buffer_mut());
        for packet in packets {
            self.emit(SessionEvent::PacketReceived(packet));
            self.statistics.record_packet_received();
            self.emit_statistics();
        }

        self.package_deadline = match self.codec.mode().package_timeout() {
            Some(timeout) if self.codec.awaiting_more(self.connection.buffer()) => {
                Instant::now().checked_add(timeout)
            }
            _ => None,
        };
    }

    fn on_resource_lost(&mut self, reason: &str) {
        tracing::warn!(
            port = self.last_port.as_deref().unwrap_or(""),
            reason,
            "device disconnected"
        );
        self.package_deadline = None;
        self.connection.close();
        self.report_state();
        self.surface_error(&LinkError::Resource(reason.to_string()));

        if self.supervisor.arm(Instant::now()) {
            self.connection.mark_reconnecting();
            self.report_state();
        }
    }

    async fn on_reconnect_due(&mut self) {
        match self.supervisor.on_fire(Instant::now()) {
            ReconnectStep::Exhausted => {
                tracing::info!(
                    attempts = self.supervisor.attempts(),
                    "reconnect attempts exhausted"
                );
                self.connection.mark_disconnected();
                self.report_state();
            }
            ReconnectStep::Attempt { attempt, max } => {
                self.statistics.record_reconnect();
                self.emit_statistics();
                self.emit(SessionEvent::Reconnecting { attempt, max });

                let Some(port) = self.last_port.clone() else {
                    self.supervisor.disarm();
                    self.connection.mark_disconnected();
                    self.report_state();
                    return;
                };
                tracing::info!(port = %port, attempt, max, "reconnecting");
                match self.connection.open(&port, &self.config).await {
                    Ok(()) => {
                        self.supervisor.on_success();
                        self.report_state();
                    }
                    Err(e) => {
                        if self.supervisor.is_armed() {
                            self.connection.mark_reconnecting();
                        } else {
                            self.connection.mark_disconnected();
                            self.report_state();
                        }
                        self.surface_error(&e);
                    }
                }
            }
        }
    }

    fn on_package_timeout(&mut self) {
        self.package_deadline = None;
        tracing::debug!(
            buffered = self.connection.buffer().len(),
            "package timed out waiting for end marker"
        );
        self.emit(SessionEvent::PackageTimeout);
    }

    fn poll_ports(&mut self) {
        if self.enumerator.poll_for_changes() {
            self.emit(SessionEvent::PortsChanged);
        }
    }

    fn surface_error(&mut self, error: &LinkError) {
        self.emit(SessionEvent::Error(error.to_string()));
        self.statistics.record_error();
        self.emit_statistics();
    }

    fn report_state(&mut self) {
        let state = self.connection.state();
        if state != self.reported_state {
            tracing::debug!(from = ?self.reported_state, to = ?state, "state changed");
            self.reported_state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit_statistics(&self) {
        self.emit(SessionEvent::StatisticsUpdated(self.statistics.clone()));
    }

    fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Read errors that do not mean the device went away
fn is_benign(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Sleep until `deadline`, or forever when there is none
fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

/// Cloneable front door to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Open { .. } => "Open",
            Command::Close { .. } => "Close",
            Command::IsOpen { .. } => "IsOpen",
            Command::State { .. } => "State",
            Command::Write { .. } => "Write",
            Command::ListDevices { .. } => "ListDevices",
            Command::ApplyConfig { .. } => "ApplyConfig",
            Command::CurrentConfig { .. } => "CurrentConfig",
            Command::Statistics { .. } => "Statistics",
            Command::ResetStatistics { .. } => "ResetStatistics",
            Command::SetAutoReconnect { .. } => "SetAutoReconnect",
            Command::SetPackageMode { .. } => "SetPackageMode",
            Command::Configure { .. } => "Configure",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SessionHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| LinkError::SessionClosed)?;
        rx.await.map_err(|_| LinkError::SessionClosed)
    }

    /// Open `port` with the current configuration, closing any open link
    pub async fn open(&self, port: impl Into<String>) -> Result<(), LinkError> {
        let port = port.into();
        self.request(|reply| Command::Open { port, reply }).await?
    }

    /// Close the link and cancel pending reconnect and package timers.
    /// Closing a closed link does nothing.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Whether the link is open
    pub async fn is_open(&self) -> Result<bool, LinkError> {
        self.request(|reply| Command::IsOpen { reply }).await
    }

    /// Current connection state
    pub async fn state(&self) -> Result<ConnectionState, LinkError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Frame and send a payload. Returns the number of framed bytes written.
    pub async fn write(&self, data: impl Into<Vec<u8>>) -> Result<usize, LinkError> {
        let data = data.into();
        self.request(|reply| Command::Write { data, reply }).await?
    }

    /// Port names of the attached CH34x adapters
    pub async fn list_available_devices(&self) -> Result<Vec<String>, LinkError> {
        self.request(|reply| Command::ListDevices { reply }).await?
    }

    /// Replace the configuration.
    ///
    /// The current link is closed. If the new configuration names a port it
    /// is opened and `Ok(true)` returned; without a port `Ok(false)`.
    /// An invalid configuration is rejected and nothing changes.
    pub async fn apply_config(&self, config: SerialConfig) -> Result<bool, LinkError> {
        let config = Box::new(config);
        self.request(|reply| Command::ApplyConfig { config, reply })
            .await?
    }

    /// Configuration in effect
    pub async fn current_config(&self) -> Result<SerialConfig, LinkError> {
        self.request(|reply| Command::CurrentConfig { reply }).await
    }

    /// Snapshot of the statistics
    pub async fn statistics(&self) -> Result<Statistics, LinkError> {
        self.request(|reply| Command::Statistics { reply }).await
    }

    /// Zero the statistics
    pub async fn reset_statistics(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::ResetStatistics { reply }).await
    }

    /// Change the reconnect policy. Resets the attempt counter; disabling
    /// cancels a pending attempt.
    ///
    /// Enabling with a zero interval is rejected and leaves the policy as it was.
    pub async fn set_auto_reconnect(
        &self,
        enabled: bool,
        interval: Duration,
        max_attempts: u32,
    ) -> Result<(), LinkError> {
        self.request(|reply| Command::SetAutoReconnect {
            enabled,
            interval,
            max_attempts,
            reply,
        })
        .await?
    }

    /// Switch between line mode and package mode.
    ///
    /// Enabling package mode with an empty end marker is rejected.
    pub async fn set_package_mode(
        &self,
        enabled: bool,
        start: impl Into<String>,
        end: impl Into<String>,
        timeout: Duration,
    ) -> Result<(), LinkError> {
        let framing = if enabled {
            FramingMode::package(start, end, timeout)
        } else {
            Ok(FramingMode::Line)
        };
        self.request(|reply| Command::SetPackageMode { framing, reply })
            .await?
    }

    /// Change the baud rate of the open link. Returns false if not open.
    pub async fn set_baud_rate(&self, baud_rate: u32) -> Result<bool, LinkError> {
        self.configure(LineSetting::BaudRate(baud_rate)).await
    }

    /// Change the data bits of the open link. Returns false if not open.
    pub async fn set_data_bits(&self, data_bits: DataBits) -> Result<bool, LinkError> {
        self.configure(LineSetting::DataBits(data_bits)).await
    }

    /// Change the stop bits of the open link. Returns false if not open.
    pub async fn set_stop_bits(&self, stop_bits: StopBits) -> Result<bool, LinkError> {
        self.configure(LineSetting::StopBits(stop_bits)).await
    }

    /// Change the parity of the open link. Returns false if not open.
    pub async fn set_parity(&self, parity: Parity) -> Result<bool, LinkError> {
        self.configure(LineSetting::Parity(parity)).await
    }

    /// Change the flow control of the open link. Returns false if not open.
    pub async fn set_flow_control(&self, flow_control: FlowControl) -> Result<bool, LinkError> {
        self.configure(LineSetting::FlowControl(flow_control)).await
    }

    /// Change the receive buffer ceiling of the open link. Returns false if
    /// not open.
    pub async fn set_read_buffer_size(&self, size: usize) -> Result<bool, LinkError> {
        self.configure(LineSetting::ReadBufferSize(size)).await
    }

    /// Close the link and stop the session task
    pub async fn shutdown(&self) -> Result<(), LinkError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn configure(&self, setting: LineSetting) -> Result<bool, LinkError> {
        self.request(|reply| Command::Configure { setting, reply })
            .await
    }
}
