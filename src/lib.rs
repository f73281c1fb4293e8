//! jms-bridge - JMS-style message delivery over a condition-driven pub/sub layer
//!
//! The bridge turns wait-set/condition reads into blocking `receive` calls
//! with timeouts, listener push delivery, client acknowledgment and
//! redelivery, and routes sends to a durable or volatile writer by delivery
//! mode.
//!
//! ```ignore
//! use jms_bridge::{Connection, ConnectionConfig, Destination, Message, SessionConfig};
//! use jms_bridge::facade::memory::MemoryDomain;
//!
//! let domain = MemoryDomain::new();
//! let connection = Connection::new(domain.create_participant(), ConnectionConfig::default())?;
//! let session = connection.create_session(SessionConfig::default())?;
//! let orders = Destination::topic("orders");
//! let consumer = session.create_consumer(&orders)?;
//! session.create_producer(&orders)?.send(&mut Message::text("hello"))?;
//! connection.start()?;
//! let message = consumer.receive_timeout(1_000)?;
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod destination;
pub mod dispatch;
pub mod errors;
pub mod facade;
pub mod gate;
pub mod ledger;
pub mod message;
pub mod observability;
pub mod producer;
pub mod selector;
pub mod session;

pub use config::{AcknowledgeMode, ConnectionConfig, SessionConfig};
pub use connection::Connection;
pub use consumer::{ConsumerOptions, MessageConsumer};
pub use destination::Destination;
pub use dispatch::{listener, MessageListener};
pub use errors::{BridgeError, BridgeResult};
pub use message::{DeliveryMode, Message, MessageBody, PropertyValue};
pub use producer::{DualDurabilityWriter, MessageProducer};
pub use selector::{MessageSelector, SelectorOp};
pub use session::Session;
