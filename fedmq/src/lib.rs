#![deny(unsafe_code)]

//! # Overall Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fedmq::bridge::transport::pair;
//! use fedmq::conf::{NetworkConnector, Settings};
//! use fedmq::context::BrokerContext;
//! use fedmq::types::Message;
//!
//! #[tokio::main]
//! async fn main() -> fedmq::Result<()> {
//!     let a = BrokerContext::new(Settings::from_toml("[broker]\nid = 1\nname = \"a\"")?);
//!     let b = BrokerContext::new(Settings::from_toml("[broker]\nid = 2\nname = \"b\"")?);
//!
//!     let (a_end, b_end) = pair(1, 2);
//!     let cfg = NetworkConnector { dynamic_only: true, network_ttl: 3, ..Default::default() };
//!     a.connect(cfg.clone(), Arc::new(a_end))?;
//!     b.connect(cfg, Arc::new(b_end))?;
//!
//!     b.queue("orders").await?;
//!     let (_id, mut deliveries) = b.subscribe("orders", 100).await?;
//!
//!     a.queue("orders").await?;
//!     a.send("orders", Message::new("orders", "hello")).await?;
//!     let delivery = deliveries.recv().await;
//!     println!("{:?}", delivery);
//!     println!("{}", a.statistics_json());
//!     Ok(())
//! }
//! ```

/// Statistics and flow control
pub mod governor; // Producer backpressure
pub mod statistic; // Statistic arena
pub mod stats; // Per-destination bundle

/// Broker core
pub mod context; // Broker instance state
pub mod destination; // Queues and topics
pub mod event; // Local destination events
pub mod store; // Message store contract

/// Federation
pub mod bridge; // Broker-to-broker bridges

pub mod error;
pub mod logger;
pub mod types;

pub use fedmq_conf as conf;
pub use fedmq_utils as utils;

pub use self::error::BrokerError;
pub use self::types::*;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
