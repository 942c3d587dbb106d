//! Build hook data models.

pub mod build_event;
pub mod push;
