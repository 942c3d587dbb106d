//! Cyhooks — push-driven build hooks with a realtime dashboard feed.
//!
//! A push webhook starts a build pipeline (sync the working copy, run the
//! provisioning command). Every build is recorded as a [`BuildEvent`] in the
//! [`EventStore`], each change is fanned out to dashboard sockets through the
//! [`BroadcastHub`], and the store is snapshotted to disk after every build.
//!
//! [`BuildEvent`]: models::build_event::BuildEvent
//! [`EventStore`]: services::event_store::EventStore
//! [`BroadcastHub`]: services::broadcast_hub::BroadcastHub

pub mod config;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod services;
