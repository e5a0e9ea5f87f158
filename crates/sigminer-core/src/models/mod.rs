//! Data models for Sigminer
//!
//! Core data structures for emails, extraction presets and answers, and contacts.

mod contact;
mod email;
mod extraction;

pub use contact::*;
pub use email::*;
pub use extraction::*;
