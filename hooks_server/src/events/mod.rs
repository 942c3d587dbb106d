//! Realtime messages emitted by the build lifecycle.
//!
//! Every store mutation produces one [`build::BroadcastMessage`]; the hub
//! fans them out and the websocket route turns them into wire frames.

pub mod build;
