//! Observability for the bridge
//!
//! - Structured logging (JSON lines on stderr)
//! - Delivery counters
//! - Begin/complete scopes for multi-step operations
//!
//! ```ignore
//! use jms_bridge::observability::{Logger, Severity};
//!
//! Logger::set_min_severity(Severity::Info);
//! Logger::info("CONSUMER_CREATED", &[("destination", "orders")]);
//! ```

mod logger;
mod metrics;
mod scope;

pub use logger::{Logger, Severity};
pub use metrics::{DeliveryMetrics, MetricsSnapshot};
pub use scope::ObservationScope;
