//! # Z-Mesh
//!
//! A chunked, acknowledged file-transfer protocol engine for Meshtastic-style
//! LoRa mesh networks.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Z-MESH ENGINE                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ┌───────────┐   decode    ┌────────────────┐   route by (peer, tid)  │
//! │   │ Mesh Port │──────────►  │ Framing Codec  │───────────┐             │
//! │   │ (device)  │◄──────────  │ (ASCII frames) │◄──────────┤             │
//! │   └───────────┘   encode    └────────────────┘           ▼             │
//! │         ▲                                          ┌──────────────┐    │
//! │         │ rate-limited                             │   Session    │    │
//! │         │ outbound queue                            │   Manager    │    │
//! │         └───────────────────────────────────────────┤              │    │
//! │                                                     └──────┬───────┘    │
//! │                                    ┌───────────────────────┼────────┐  │
//! │                                    ▼                       ▼        │  │
//! │                          ┌──────────────────┐   ┌──────────────────┐│  │
//! │                          │ Transfer Sessions │   │  Node Registry  ││  │
//! │                          │ (sender/receiver) │   │  (PING/PONG,    ││  │
//! │                          │                   │   │  SNR/RSSI)      ││  │
//! │                          └────────┬──────────┘   └────────┬────────┘│  │
//! │                                   │                        │         │  │
//! │                                   └───────────┬────────────┘         │  │
//! │                                                ▼                     │  │
//! │                                       ┌──────────────────┐           │  │
//! │                                       │    Event Bus     │           │  │
//! │                                       └──────────────────┘           │  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire engine
//! - [`config`] - Tunable protocol parameters and their defaults
//! - [`framing`] - The wire frame grammar: encode/decode, filename sanitization
//! - [`mesh_port`] - The device adapter boundary (`MeshPort` trait, node ids)
//! - [`node`] - Peer discovery and staleness tracking
//! - [`sink`] - File delivery/read collaborators (`FileSink`, `FileSource`)
//! - [`transfer`] - Sender and receiver transfer state machines
//! - [`session_manager`] - Owns every live session, routes frames, drives ticks
//! - [`events`] - The typed event bus transfers and discovery publish to
//! - [`time`] - Wall-clock helpers for logging and display
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         SINGLE PROTOCOL TASK                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  One task owns the `SessionManager` outright. `on_inbound()` handles    │
//! │  one frame at a time; `tick()` advances every watchdog, the discovery   │
//! │  PING timer, and the token-bucket rate limiter by one step. All         │
//! │  deadlines take an explicit `now: Instant` rather than reading the      │
//! │  clock, so a test can drive the whole engine without real time passing. │
//! │  There is no internal locking inside the manager itself; callers from   │
//! │  other tasks go through the `Engine` facade below instead.              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod error;
pub mod events;
pub mod framing;
pub mod mesh_port;
pub mod node;
pub mod session_manager;
pub mod sink;
/// Wall-clock helpers for logging and display.
pub mod time;
pub mod transfer;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus, Subscription};
pub use framing::Frame;
pub use mesh_port::{Destination, InboundFrame, LinkMetrics, MeshPort, NodeId};
pub use session_manager::SessionManager;
pub use sink::{DirectorySink, FileSink, FileSource, PathFileSource};
pub use transfer::{ReceiverSession, ReceiverState, SenderSession, SenderState};

// ============================================================================
// ENGINE INSTANCE
// ============================================================================

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::Mutex;

/// Global Z-Mesh engine instance.
static ENGINE_INSTANCE: OnceCell<Arc<Mutex<SessionManager>>> = OnceCell::new();

/// Process-wide handle to the one running [`SessionManager`].
///
/// Most applications only ever need one engine per mesh port, so `Engine`
/// gives callers a shared handle instead of threading a `SessionManager`
/// through every task that wants to start a transfer or subscribe to events.
/// The instance is wrapped in a `tokio::sync::Mutex` rather than
/// `parking_lot`'s, since `SessionManager::on_inbound`/`tick` hold the lock
/// across `.await` points.
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                         ENGINE LIFECYCLE                                │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. Initialize                                                          │
/// │     ┌─────────────┐                                                    │
/// │     │  Engine::   │──► Validate config                                 │
/// │     │ initialize()│──► Wrap the Mesh Port in a SessionManager           │
/// │     └─────────────┘──► Publish the global instance                     │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  2. Drive the Protocol Task                                           │
/// │     ┌─────────────┐                                                    │
/// │     │  Engine::   │◄─► port.recv() → on_inbound()                      │
/// │     │ instance()  │◄─► tick interval → tick()                          │
/// │     └─────────────┘◄─► start_transfer() / abort_transfer()             │
/// │            │                                                           │
/// │            ▼                                                           │
/// │  3. Shutdown                                                          │
/// │     ┌─────────────┐                                                    │
/// │     │  Engine::   │──► Abort every live session                        │
/// │     │ shutdown()  │──► Flush outbound best-effort                      │
/// │     └─────────────┘──► Publish a shutdown LogLine event                │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
pub struct Engine;

impl Engine {
    /// Initialize the engine over `port`, with `local_name` advertised in
    /// PONG replies and completed transfers persisted via `sink`.
    ///
    /// This should be called once at application startup. Returns
    /// `Error::AlreadyInitialized` if called a second time.
    pub fn initialize(
        port: Box<dyn MeshPort>,
        config: Config,
        sink: Arc<dyn FileSink>,
        local_name: impl Into<String>,
    ) -> Result<()> {
        config.validate()?;
        let manager = SessionManager::new(port, config, sink, local_name);
        ENGINE_INSTANCE
            .set(Arc::new(Mutex::new(manager)))
            .map_err(|_| Error::AlreadyInitialized)?;
        tracing::info!(at = time::now_timestamp(), "engine initialized");
        Ok(())
    }

    /// Get the global engine instance.
    ///
    /// Returns `Error::NotInitialized` if `initialize` hasn't run yet.
    pub fn instance() -> Result<Arc<Mutex<SessionManager>>> {
        ENGINE_INSTANCE.get().cloned().ok_or(Error::NotInitialized)
    }

    /// Check whether the engine has been initialized.
    pub fn is_initialized() -> bool {
        ENGINE_INSTANCE.get().is_some()
    }

    /// Abort every live session and flush pending frames, if the engine is
    /// running. A no-op if the engine was never initialized.
    pub async fn shutdown(reason: &str) {
        if let Some(engine) = ENGINE_INSTANCE.get() {
            engine.lock().await.shutdown(reason).await;
        }
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of the Z-Mesh engine.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns build information for debugging.
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: env!("CARGO_PKG_VERSION"),
        profile: if cfg!(debug_assertions) { "debug" } else { "release" },
    }
}

/// Build information for debugging.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Crate version.
    pub version: &'static str,
    /// Build profile (debug/release).
    pub profile: &'static str,
}

// ============================================================================
// TESTS
// ============================================================================
