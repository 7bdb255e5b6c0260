//! Metering pipeline for z-meter.
//!
//! Turns completed LLM calls into priced usage events, batches them and
//! delivers the batches to a collector in the background.
//!
//! # Example
//!
//! ```no_run
//! use z_meter_client::{scope, Meter, MeterConfig};
//! use z_meter_core::CallObservation;
//!
//! # async fn example() -> Result<(), z_meter_client::ClientError> {
//! let config = MeterConfig::new("my-project")
//!     .with_collector("http://collector:8080", "your-api-key");
//! let meter = Meter::start(config)?;
//!
//! scope::with_agent("planner", async {
//!     let call = CallObservation::new("openai", "gpt-4o")
//!         .with_io("What is 2 + 2?", "4")
//!         .with_reported_usage(12, 1);
//!     meter.record(&call);
//! })
//! .await;
//!
//! let report = meter.shutdown().await;
//! println!("delivered {} events", report.stats.events_delivered);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod buffer;
pub mod config;
pub mod delivery;
pub mod error;
pub mod global;
pub mod meter;
mod queue;
pub mod resend;
pub mod scope;
pub mod stats;
pub mod transport;
pub mod types;

pub use config::{MeterConfig, ResendConfig};
pub use delivery::{send_with_retry, DeliveryAttempt, DeliveryState, RetryPolicy};
pub use error::{ClientError, TransportError};
pub use meter::{Meter, MeterBuilder, ShutdownReport};
pub use resend::{resend_spilled, ResendReport};
pub use stats::MeterStats;
pub use transport::{HttpTransport, Transport};
pub use types::{Ack, BatchUsageRequest, BatchUsageResponse};
