//! Real-time machine telemetry pipeline.
//!
//! Records pulled from a broker are decoded and validated by the
//! [`consumer`], persisted through an [`store::EventStore`], analyzed by the
//! per-machine [`anomaly`] engine, and fanned out to live subscribers by the
//! [`hub`]. The [`agent`] owns the wiring and lifecycle.

pub mod agent;
pub mod anomaly;
pub mod config;
pub mod consumer;
pub mod event;
pub mod hub;
pub mod server;
pub mod store;
