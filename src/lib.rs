//! # skywire
//!
//! Distributed object broker for observatory automation.
//!
//! Every driver, instrument and controller is a named object living at a
//! [`Location`] like `127.0.0.1:7666/Telescope/main`. Callers get a
//! [`Proxy`] for a location and call methods on it; the call travels to the
//! process hosting the object, runs there, and the result or failure comes
//! back. Objects publish events ("slew complete") to any number of
//! subscribed handlers.
//!
//! ## Architecture
//!
//! - **Manager**: one per process; hosts objects and owns the pieces below
//! - **Server**: receives requests for the local bus and dispatches them
//! - **Transport**: moves requests, responses and events over TCP, either as
//!   direct socket links or through a shared queue host
//! - **Events engine**: subscription table and best-effort fan-out
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use skywire::classloader::ClassDescriptor;
//! use skywire::object::{Hosted, MethodTable};
//! use skywire::{BrokerConfig, Manager};
//!
//! struct Dome;
//!
//! #[tokio::main]
//! async fn main() -> skywire::Result<()> {
//!     let manager = Manager::start(BrokerConfig::default()).await?;
//!
//!     let class = ClassDescriptor::new("Dome", |_ctx| {
//!         Ok(Hosted::new(
//!             Dome,
//!             MethodTable::new().method("open", |_d: Arc<Dome>, (): (), _ctx| async move { Ok(true) }),
//!         ))
//!     });
//!     let dome = manager.add_class(&class, Some("dome"), Default::default(), true).await?;
//!     assert!(dome.call("open", vec![]).await?.as_bool().unwrap_or(false));
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod classloader;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod location;
pub mod logging;
pub mod manager;
pub mod object;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transport;
pub mod value;

mod backpressure;
mod writer;

pub use config::BrokerConfig;
pub use error::{BrokerError, Result};
pub use location::{Location, Name};
pub use manager::Manager;
pub use proxy::{PendingCall, Proxy, ProxyMethod};
pub use value::Value;
pub use writer::WriterConfig;
