//! # Statecast Client Library
//!
//! This library provides the client-side half of the Statecast
//! state-synchronization engine: a local mirror of the server's state
//! tree, optimistic constraint prediction, and the TCP plumbing that
//! connects the two.
//!
//! ## Architecture Overview
//!
//! The client never owns state. It applies the server's differential
//! updates in arrival order and exposes the result as a plain value
//! tree; its own writes go out as edits and come back as authoritative
//! echoes.
//!
//! ### The Mirror
//! Every update kind the server broadcasts has a local application
//! rule: edits write or remove values, shifts reindex lists without
//! resending their elements, self properties carry per-client settings
//! and constraint tables, and an initialize resets the mirror to a
//! fresh snapshot.
//!
//! ### Prediction
//! The server shares the built-in rules guarding each writable cell.
//! Running a write through them locally shows the clamped value the
//! server will store, or that it will refuse the write, before the
//! round trip completes. Server-only custom constraints stay out of
//! the table, so a prediction is a preview, never a promise.
//!
//! ## Module Organization
//!
//! ### Mirror Module (`mirror`)
//! Applies the update stream: agent subtrees, list shifts and holes,
//! constraint tables, self properties, peer and team tracking, and
//! queued named messages.
//!
//! ### Predict Module (`predict`)
//! Runs candidate writes through the distributed rule chains and
//! optionally applies the expected outcome to the mirror ahead of the
//! server's echo.
//!
//! ### Network Module (`network`)
//! Line-framed TCP connection: receives batch payloads, sends edits
//! and named messages.

pub mod mirror;
pub mod network;
pub mod predict;
