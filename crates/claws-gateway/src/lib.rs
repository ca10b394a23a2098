//! Client for the claws agent gateway.
//!
//! A [`GatewayClient`] keeps one authenticated WebSocket session alive,
//! correlates request/response pairs, and fans every inbound frame out to
//! subscribers. [`StreamReassembler`] is the subscriber that turns streamed
//! chat fragments into whole messages.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod reassembler;
pub mod settings;
pub mod transport;

pub use broadcast::{Broadcaster, Subscription};
pub use config::{ClientIdentity, ConnectParams, GatewayConfig};
pub use connection::{ConnectionState, GatewayClient};
pub use correlator::PendingSummary;
pub use error::{GatewayError, RequestError, SettingsError, TransportError};
pub use reassembler::StreamReassembler;
pub use settings::{FileSettings, MemorySettings, SettingsStore, StoredSettings};
pub use transport::{Connector, Transport, TransportEvent, WsConnector};
