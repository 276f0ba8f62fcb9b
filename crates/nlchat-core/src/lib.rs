//! # NLChat Core Library
//!
//! Serial link core for NLChat, a chat-style terminal for CH34x USB-serial
//! adapters.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - CH34x device discovery and hotplug detection
//! - Newline (line) and marker-delimited (package) framing
//! - A bounded receive buffer that keeps the newest data on overflow
//! - Bounded automatic reconnection
//! - Traffic statistics
//!
//! ## Supported adapters
//!
//! - CH340 / CH340K / CH343
//! - CH341
//! - CH330
//!
//! ## Example
//!
//! ```rust,ignore
//! use nlchat_core::prelude::*;
//!
//! let (session, mut events) = SessionManager::spawn_system();
//! session.open("/dev/ttyUSB0").await?;
//! session.write("hello").await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::PacketReceived(packet) = event {
//!         println!("{}", String::from_utf8_lossy(&packet));
//!     }
//! }
//! ```

pub mod link;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::link::{
        ConnectionState, FramingMode, LinkError, SerialConfig, SessionEvent, SessionHandle,
        SessionManager, Statistics,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
