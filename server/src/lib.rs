//! # Statecast Server Library
//!
//! This library provides the authoritative half of the Statecast
//! state-synchronization engine. It keeps the canonical state tree for
//! every connected agent, validates incoming writes, and broadcasts
//! compacted differential updates so that every client mirror converges
//! on what it is allowed to see.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative State
//! The server owns the definitive copy of every agent's subtree. All
//! writes, whether they come from application code or from clients,
//! pass through the same constraint chains; clients receive and conform
//! to whatever the server ends up storing.
//!
//! ### Agent Management
//! Handles the complete lifecycle of clients and teams including:
//! - Connection admission, id assignment and welcome snapshots
//! - Inbound update validation and authority checks
//! - Disconnection teardown and visibility cleanup
//! - Malformed-traffic accounting and abuse cutoff
//!
//! ### Differential Broadcasting
//! On every tick the per-client queues are compacted (last write wins,
//! removals cancel queued edits, list shifts fence reordering) and
//! flushed as one batch per client, skipping connections whose sockets
//! are already backed up.
//!
//! ## Module Organization
//!
//! ### State (`node`, `tree`, `constraint`, `visibility`)
//! The reactive tree itself: node shapes, path addressing, write
//! validation, constraint chains with client-shareable rule specs, and
//! per-viewer filtered serialization.
//!
//! ### Agents (`agents`, `ident`)
//! Client and team bookkeeping: registration, team membership,
//! per-client counters and the random id allocator.
//!
//! ### Delivery (`scheduler`, `transport`, `network`)
//! Per-client ordered queues with tick compaction and backpressure, the
//! [`transport::Transport`] seam the scheduler writes through, and the
//! tokio TCP gateway with its per-connection reader and writer tasks.
//!
//! ### Facade (`engine`)
//! The [`engine::Engine`] ties everything together: lifecycle, events,
//! named messages, tick hooks and the tree/team/visibility APIs the
//! application programs against.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::engine::{Engine, EngineConfig, EVENT_CONNECT};
//! use server::network::{Gateway, TcpTransport};
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(TcpTransport::new());
//!     let engine = Arc::new(Mutex::new(Engine::new(
//!         EngineConfig::default(),
//!         transport.clone(),
//!     )));
//!
//!     {
//!         // Give every client a score cell the moment it connects.
//!         let mut engine = engine.lock().await;
//!         engine.on(EVENT_CONNECT, |eng, client, _| {
//!             let path = vec![client.to_string(), "score".to_string()];
//!             let _ = eng.set(&path, serde_json::json!(0));
//!         });
//!     }
//!
//!     let gateway = Gateway::bind("127.0.0.1:4000", engine, transport).await?;
//!     gateway.run().await;
//!     Ok(())
//! }
//! ```
//!
//! The gateway runs the accept loop and the broadcast tick on one task;
//! each accepted connection gets a reader task feeding the engine and a
//! writer task draining its payload channel.

pub mod agents;
pub mod constraint;
pub mod engine;
pub mod ident;
pub mod network;
pub mod node;
pub mod scheduler;
pub mod transport;
pub mod tree;
pub mod visibility;
