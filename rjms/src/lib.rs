#![deny(unsafe_code)]
#![recursion_limit = "256"]

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//! use rjms::broker::{Broker, BrokerCore};
//! use rjms::context::ServerContext;
//! use rjms::hook::{Intercepted, LogInterceptor};
//! use rjms::types::{DestinationConfig, Message};
//! use rjms::Result;
//!
//! # async fn transport() -> rjms::session::TransportRef { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = ServerContext::new().build().await;
//!     let core = BrokerCore::new(scx);
//!     core.start().await?;
//!     core.create_destination("orders".into(), DestinationConfig::queue()).await?;
//!
//!     let broker = Intercepted::new(core).interceptor(LogInterceptor);
//!     broker.open_connection("conn-1".into(), Default::default(), transport().await).await?;
//!     broker.add_message(&"conn-1".into(), Message::new("orders", "hello"), None).await?;
//!     Ok(())
//! }
//! ```

/// Inbound API and transaction coordination
pub mod broker;
pub mod context; // Shared services
pub mod destination; // Queue and topic destinations
pub mod error;
pub mod hook; // Interceptor chain
pub mod logger;
pub mod persist; // Persistence collaborator
pub mod queue; // Ordered per-destination queue
pub mod selector;
pub mod session; // Consumer sessions and delivery pipeline
pub mod state; // Authentication, client ids and durable registry
pub mod stats;
pub mod store; // Two tier message cache
pub mod timer;
pub mod txn;
pub mod types;

pub use error::{BrokerError, Result};
pub use rjms_conf as conf;
pub use rjms_utils as utils;
