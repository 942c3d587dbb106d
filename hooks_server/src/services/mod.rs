//! Build hook services — event lifecycle, fan-out, execution, persistence.

pub mod broadcast_hub;
pub mod event_store;
pub mod executor;
pub mod notify_service;
pub mod pipeline;
pub mod snapshot;
