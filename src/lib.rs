//! # PV Inverter Bridge
//!
//! Takes JSON telemetry frames published by an inverter gateway on an MQTT
//! broker and republishes them as a PV-inverter service on a path-keyed
//! service bus.
//!
//! ## Features
//!
//! - **Bounded frame queue**: at most four frames retained, oldest evicted first
//! - **Latest-wins publishing**: each tick commits only the newest frame
//! - **Update index**: 0..=255 revision counter advanced on every publish
//! - **Sign of life**: periodic status block in the log
//! - **Bus access port**: JSON-lines TCP surface for get, set, dump and watch
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use pvbridge::bus::{LocalBus, ServiceBus};
//! use pvbridge::config::DeviceConfig;
//! use pvbridge::{FeedSubscriber, FrameQueue, RevisionPublisher};
//!
//! let device = DeviceConfig {
//!     instance: 40,
//!     serial: "3001234567".into(),
//!     custom_name: "Garage roof".into(),
//!     product_name: "MQTT Inverter".into(),
//!     connection: "MQTT Inverter JSON service".into(),
//!     position: 0,
//! };
//! let mut bus = LocalBus::new(pvbridge::service::service_name(device.instance));
//! pvbridge::service::register_service(&mut bus, &device).unwrap();
//!
//! let queue = Arc::new(FrameQueue::new());
//! let feed = FeedSubscriber::new(Arc::clone(&queue), "inverter");
//! feed.handle_message(
//!     "sma2/3001234567/inverter",
//!     br#"{"spotacvoltage1":230,"spotacvoltage2":230,"spotacvoltage3":230,
//!         "spotacamperage1":1,"spotacamperage2":1,"spotacamperage3":1,
//!         "spotacpower1":230,"spotacpower2":230,"spotacpower3":230,
//!         "spotacpower":690,"total":1500}"#,
//! );
//!
//! let mut publisher = RevisionPublisher::new(queue);
//! publisher.run_cycle(&mut bus);
//! assert_eq!(bus.get("/UpdateIndex").unwrap().as_i64(), Some(1));
//! ```
//!
//! ## Architecture
//!
//! - [`subscriber`] - MQTT session, topic filter and frame decoding
//! - [`queue`] - Bounded hand-off between the broker task and the bus loop
//! - [`publisher`] - Per-tick commit of the newest frame
//! - [`liveness`] - Sign-of-life reporting
//! - [`runtime`] - The bus loop owning the bus and its timers
//! - [`server`] - TCP access to the bus

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod bus;
pub mod config;
pub mod frame;
pub mod liveness;
pub mod logging;
pub mod protocol;
pub mod publisher;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod subscriber;

// Re-export main public types for convenience
pub use bus::{LocalBus, ServiceBus};
pub use config::BridgeConfig;
pub use frame::TelemetryFrame;
pub use liveness::LivenessReporter;
pub use publisher::RevisionPublisher;
pub use queue::FrameQueue;
pub use runtime::{BridgeRuntime, BusHandle};
pub use server::BusServer;
pub use subscriber::{FeedConnection, FeedSubscriber};
