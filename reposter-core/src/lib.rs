#![doc = "reposter-core: event-driven orchestration engine for reposter."]

//! Discovers new items of configured sources, resolves their media and publishes
//! them to every bound destination, remembering per binding the last item that
//! reached all of its destinations.
//!
//! Stages talk only through the [`bus::EventBus`]:
//!
//! ```text
//! Scheduler -> CheckRequested -> FetchStage -> ItemsDiscovered -> Processor
//!   -> ItemProcessed -> Dispatcher -> PublishCompleted -> HealthMonitor
//! ```
//!
//! Network and process access lives behind the traits in [`contract`]; the
//! binary crate provides the concrete adapters.
//!
//! # Usage
//! Build [`app::Adapters`], hand them to [`app::AppManager`] with the loaded
//! [`config::Settings`] and start it.

pub mod app;
pub mod binding;
pub mod bus;
pub mod config;
pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod health;
pub mod pipeline;
pub mod processor;
pub mod scheduler;
pub mod state;
pub mod text;
