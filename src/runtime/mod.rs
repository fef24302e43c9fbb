//! # Runtime Module
//!
//! Application lifecycle, message dispatch and the threads behind them.
//!
//! ## Key Types
//!
//! - [`Application`] - owns the runtime components and drives the lifecycle
//! - [`Dispatcher`] / [`MessageHandler`] - handler tables and dispatch onto the pool
//! - [`ThreadPool`] - bounded, keyed worker pool
//! - [`Scheduler`] - timer thread for discovery ticks and periodic notifications
//! - [`RuntimeConfig`] - JSON configuration
//!
//! ## Lifecycle
//!
//! 1. Build: `Application::new("service", config)` or `Application::load("config.json", "service")`
//! 2. Offer services, register handlers (queued until start)
//! 3. `init()` opens the transports, `start()` blocks until `stop()`
//! 4. `stop()` from another thread (a signal handler, a handler, a test)
//!
//! ## Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use someip_middleware::{Application, Message, RuntimeConfig, ServiceKey};
//! use std::net::SocketAddr;
//!
//! let key = ServiceKey::new(0x1234, 0x5678);
//! let app = Application::new("service", RuntimeConfig::default());
//! app.offer_service(key, [0x0421]).unwrap();
//! app.register_handler(key, 0x0421, |request: &Message, _from: SocketAddr| -> Option<Bytes> {
//!     Some(request.payload().clone())
//! })
//! .unwrap();
//! app.init().unwrap();
//! app.start().unwrap();
//! ```

pub mod application;
pub mod config;
pub mod dispatcher;
pub mod scheduler;
pub mod threadpool;

pub use application::{Application, ApplicationBuilder, LifecycleState, PendingResponse};
pub use config::{RuntimeConfig, SdConfig};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use scheduler::{Scheduler, TaskId};
pub use threadpool::ThreadPool;
