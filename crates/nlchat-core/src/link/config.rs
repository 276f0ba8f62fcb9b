//! Link configuration
//!
//! `SerialConfig` is the single record a front-end hands to the session. It
//! is replaced wholesale on every `apply_config` and can be persisted as
//! JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{
    LinkError, DEFAULT_BAUD_RATE, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_PACKAGE_TIMEOUT, DEFAULT_RECONNECT_INTERVAL,
};

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataBits {
    Five,
    Six,
    Seven,
    #[default]
    Eight,
}

impl DataBits {
    /// Build from a bit count (5-8)
    pub fn from_count(bits: u8) -> Option<Self> {
        match bits {
            5 => Some(DataBits::Five),
            6 => Some(DataBits::Six),
            7 => Some(DataBits::Seven),
            8 => Some(DataBits::Eight),
            _ => None,
        }
    }

    /// Bit count
    pub fn count(self) -> u8 {
        match self {
            DataBits::Five => 5,
            DataBits::Six => 6,
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

impl From<DataBits> for serialport::DataBits {
    fn from(bits: DataBits) -> Self {
        match bits {
            DataBits::Five => serialport::DataBits::Five,
            DataBits::Six => serialport::DataBits::Six,
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

impl TryFrom<StopBits> for serialport::StopBits {
    type Error = LinkError;

    fn try_from(bits: StopBits) -> Result<Self, Self::Error> {
        match bits {
            StopBits::One => Ok(serialport::StopBits::One),
            StopBits::Two => Ok(serialport::StopBits::Two),
            StopBits::OnePointFive => Err(LinkError::UnsupportedSetting(
                "1.5 stop bits".to_string(),
            )),
        }
    }
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl TryFrom<Parity> for serialport::Parity {
    type Error = LinkError;

    fn try_from(parity: Parity) -> Result<Self, Self::Error> {
        match parity {
            Parity::None => Ok(serialport::Parity::None),
            Parity::Odd => Ok(serialport::Parity::Odd),
            Parity::Even => Ok(serialport::Parity::Even),
            Parity::Mark | Parity::Space => Err(LinkError::UnsupportedSetting(format!(
                "{} parity",
                parity
            ))),
        }
    }
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

impl From<FlowControl> for serialport::FlowControl {
    fn from(flow: FlowControl) -> Self {
        match flow {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        })
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
            Parity::Mark => "mark",
            Parity::Space => "space",
        })
    }
}

impl fmt::Display for FlowControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FlowControl::None => "none",
            FlowControl::Hardware => "hardware",
            FlowControl::Software => "software",
        })
    }
}

impl FromStr for StopBits {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" => Ok(StopBits::One),
            "1.5" => Ok(StopBits::OnePointFive),
            "2" => Ok(StopBits::Two),
            other => Err(LinkError::InvalidConfig(format!(
                "stop bits must be 1, 1.5 or 2, got '{}'",
                other
            ))),
        }
    }
}

impl FromStr for Parity {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "odd" | "o" => Ok(Parity::Odd),
            "even" | "e" => Ok(Parity::Even),
            "mark" | "m" => Ok(Parity::Mark),
            "space" | "s" => Ok(Parity::Space),
            other => Err(LinkError::InvalidConfig(format!("unknown parity '{}'", other))),
        }
    }
}

impl FromStr for FlowControl {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(FlowControl::None),
            "hard" | "hardware" | "rtscts" => Ok(FlowControl::Hardware),
            "soft" | "software" | "xonxoff" => Ok(FlowControl::Software),
            other => Err(LinkError::InvalidConfig(format!(
                "unknown flow control '{}'",
                other
            ))),
        }
    }
}

/// How packets are delimited inside the byte stream
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum FramingMode {
    /// One packet per `\n`-terminated line, normalized to UTF-8 text
    #[default]
    Line,
    /// Packets wrapped in explicit markers, passed through untouched
    Package {
        /// Marker preceding each payload, may be empty
        #[serde(default)]
        start: String,
        /// Marker terminating each payload, never empty
        end: String,
        /// Inactivity window after which an incomplete package is reported
        #[serde(with = "duration_ms", default = "default_package_timeout")]
        timeout: Duration,
    },
}

impl FramingMode {
    /// Build a validated package mode
    pub fn package(
        start: impl Into<String>,
        end: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LinkError> {
        let mode = FramingMode::Package {
            start: start.into(),
            end: end.into(),
            timeout,
        };
        mode.validate()?;
        Ok(mode)
    }

    /// Package mode with no start marker, `\n` end marker and 1 s timeout
    pub fn package_default() -> Self {
        FramingMode::Package {
            start: String::new(),
            end: "\n".to_string(),
            timeout: DEFAULT_PACKAGE_TIMEOUT,
        }
    }

    /// Whether this is package mode
    pub fn is_package(&self) -> bool {
        matches!(self, FramingMode::Package { .. })
    }

    /// Inactivity timeout, package mode only
    pub fn package_timeout(&self) -> Option<Duration> {
        match self {
            FramingMode::Package { timeout, .. } => Some(*timeout),
            FramingMode::Line => None,
        }
    }

    /// Check the marker invariants
    pub fn validate(&self) -> Result<(), LinkError> {
        if let FramingMode::Package { end, timeout, .. } = self {
            if end.is_empty() {
                return Err(LinkError::InvalidConfig(
                    "package mode requires a non-empty end marker".to_string(),
                ));
            }
            if timeout.is_zero() {
                return Err(LinkError::InvalidConfig(
                    "package timeout must be greater than zero".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn default_package_timeout() -> Duration {
    DEFAULT_PACKAGE_TIMEOUT
}

/// Complete link configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port to open (e.g. "/dev/ttyUSB0" or "COM3"), empty for none
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Parity
    pub parity: Parity,
    /// Flow control
    pub flow_control: FlowControl,
    /// Ceiling of the receive buffer in bytes
    pub read_buffer_size: usize,
    /// Largest framed write accepted in bytes
    pub write_buffer_size: usize,
    /// Reopen the port automatically after the device disappears
    pub auto_reconnect: bool,
    /// Delay between reconnect attempts
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Packet framing
    pub framing: FramingMode,
    /// Encoding label used when a received line is not valid UTF-8.
    /// `None` uses the host locale.
    pub fallback_encoding: Option<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            auto_reconnect: false,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            framing: FramingMode::Line,
            fallback_encoding: None,
        }
    }
}

impl SerialConfig {
    /// Default configuration for the given port
    pub fn for_port(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Check the configuration for values the link cannot run with
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.baud_rate == 0 {
            return Err(LinkError::InvalidConfig(
                "baud rate must be greater than zero".to_string(),
            ));
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err(LinkError::InvalidConfig(
                "buffer sizes must be greater than zero".to_string(),
            ));
        }
        if self.auto_reconnect && self.reconnect_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "reconnect interval must be greater than zero".to_string(),
            ));
        }
        if let Some(label) = &self.fallback_encoding {
            if encoding_rs::Encoding::for_label(label.as_bytes()).is_none() {
                return Err(LinkError::InvalidConfig(format!(
                    "unknown text encoding '{}'",
                    label
                )));
            }
        }
        self.framing.validate()
    }

    /// Load a configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, LinkError> {
        let content = fs::read_to_string(path)?;
        let config: SerialConfig = serde_json::from_str(&content)
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), LinkError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| LinkError::InvalidConfig(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Durations are stored as whole milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_115200_8n1() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 115200);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.flow_control, FlowControl::None);
        assert_eq!(config.read_buffer_size, 10 * 1024 * 1024);
        assert_eq!(config.framing, FramingMode::Line);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_package_mode_requires_end_marker() {
        let err = FramingMode::package("<", "", Duration::from_millis(500)).unwrap_err();
        assert!(matches!(err, LinkError::InvalidConfig(_)));

        assert!(FramingMode::package("", ">", Duration::from_millis(500)).is_ok());
    }

    #[test]
    fn test_data_bits_range() {
        assert_eq!(DataBits::from_count(5), Some(DataBits::Five));
        assert_eq!(DataBits::from_count(8).map(DataBits::count), Some(8));
        assert_eq!(DataBits::from_count(4), None);
        assert_eq!(DataBits::from_count(9), None);
    }

    #[test]
    fn test_parse_line_settings() {
        assert_eq!("1.5".parse::<StopBits>().unwrap(), StopBits::OnePointFive);
        assert_eq!("EVEN".parse::<Parity>().unwrap(), Parity::Even);
        assert_eq!("hard".parse::<FlowControl>().unwrap(), FlowControl::Hardware);
        assert!("3".parse::<StopBits>().is_err());
        assert!("sideways".parse::<Parity>().is_err());
    }

    #[test]
    fn test_unsupported_serialport_settings() {
        assert!(serialport::StopBits::try_from(StopBits::OnePointFive).is_err());
        assert!(serialport::Parity::try_from(Parity::Mark).is_err());
        assert!(serialport::Parity::try_from(Parity::Odd).is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_baud() {
        let config = SerialConfig {
            baud_rate: 0,
            ..SerialConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_encoding() {
        let config = SerialConfig {
            fallback_encoding: Some("not-a-charset".to_string()),
            ..SerialConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SerialConfig {
            fallback_encoding: Some("gbk".to_string()),
            ..SerialConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_framing_tag() {
        let config = SerialConfig {
            framing: FramingMode::package("<", ">", Duration::from_millis(250)).unwrap(),
            ..SerialConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"mode\":\"package\""));
        assert!(json.contains("\"timeout\":250"));
    }
}
