//! Core data models for the chunked upload service.
//!
//! `upload_session` holds the session entity and its transition rules,
//! `progress` the views handed back to callers and `multipart` the values
//! exchanged with the remote object store.

pub mod multipart;
pub mod progress;
pub mod upload_session;
