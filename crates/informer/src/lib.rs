//! Mirra informer: reflector, shared informer and the per-kind informer factory.
//!
//! A [`SharedInformer`] owns one [`Reflector`] feeding one store and fans every
//! change out to registered [`EventHandler`]s. The [`SharedInformerFactory`]
//! caches one informer per resource type so consumers share a single
//! list/watch connection.

#![forbid(unsafe_code)]

pub mod config;
pub mod factory;
pub mod handler;
mod processor;
pub mod reflector;
pub mod shared;
pub mod testing;

pub use config::{InformerConfig, OverflowPolicy, ShutdownPolicy};
pub use factory::{SharedInformerFactory, TypedInformer};
pub use handler::{notification_channel, ChannelHandler, EventHandler, HandlerFuncs, Notification};
pub use reflector::{Reflector, ReflectorPhase, ReflectorSink, ReflectorState, MIN_WATCH_DURATION};
pub use shared::{Registration, SharedInformer};

pub use tokio_util::sync::CancellationToken;
