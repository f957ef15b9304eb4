//! clusterwatch-bus — control-plane calls between engine instances.
//!
//! Engines bind to the bus under `(topic, engine_id)` and receive calls
//! addressed either to them specifically or broadcast to every engine on
//! the topic. Callers get a bounded wait: silence past the timeout is
//! reported as failure, never as a hang.
//!
//! # Architecture
//!
//! ```text
//! Notifier (caller side)
//!   └── NotificationChannel::call(Target, ExecutionContext, Call, timeout)
//!         ├── Target::server(topic, engine_id) → one listener, one reply
//!         └── Target::broadcast(topic)         → every listener, first Ok wins
//!
//! Listener (server side, one per engine)
//!   └── receive loop → one task per inbound call → CallHandler::handle()
//! ```
//!
//! `LocalBus` is the in-process transport: bindings are mpsc senders and
//! replies travel back over oneshot channels.

pub mod error;
pub mod local;
pub mod message;
pub mod notify;

pub use error::{BusError, BusResult};
pub use local::{Listener, LocalBus};
pub use message::{BoxFuture, Call, CallHandler, NotificationChannel, Target};
pub use notify::Notifier;
