//! daybreak: alarm core that wakes you with freshly generated speech.
//!
//! The crate is a set of cooperating services wired together by
//! [`app::Daybreak`]. Platform-specific pieces (host scheduler, speech
//! and text providers, ringing output, timezone source) sit behind traits.

pub mod api;
pub mod app;
pub mod audio;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dismissal;
pub mod error;
pub mod events;
pub mod generation;
pub mod history;
pub mod model;
pub mod reconcile;
pub mod repository;
pub mod scheduling;
pub mod sounder;
pub mod storage;

#[cfg(test)]
pub mod testing;
