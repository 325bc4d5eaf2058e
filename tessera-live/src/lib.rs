//! # tessera-live — Server-side live views over WebSocket
//!
//! Keeps a browser in sync with server-held state by re-rendering on every
//! event and sending only what changed.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   phx_join / event   ┌──────────────┐
//! │   Browser   │ ───────────────────► │  LiveServer  │
//! │ (client js) │ ◄─────────────────── │ (per socket) │
//! └─────────────┘   reply / diff push  └──────┬───────┘
//!                                             │ Connection (topic → channel)
//!                                             ▼
//!                                     ┌───────────────┐     ┌──────────────┐
//!                                     │LiveViewManager│ ──► │ LiveView     │
//!                                     │ ctx, previous │     │ mount/render │
//!                                     │ tree, cids    │ ──► │ LiveComponent│
//!                                     └───────┬───────┘     └──────────────┘
//!                                             │
//!                       ┌─────────────────────┼──────────────────────┐
//!                       ▼                     ▼                      ▼
//!                SessionVerifier         PubSub (hub)        FlashStore / FileStager
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Five-element JSON envelopes and their payloads
//! - [`view`] — The `LiveView` trait, events and render metadata
//! - [`component`] — Stateful nested components and their registry
//! - [`socket`] — Side-channel handed to callbacks
//! - [`manager`] — Per-view lifecycle: join, events, infos, navigation
//! - [`connection`] — Topic multiplexing for one socket
//! - [`router`] — Path → view table
//! - [`server`] — WebSocket transport
//! - [`session`], [`flash`], [`pubsub`], [`upload`] — Collaborators

pub mod component;
pub mod connection;
pub mod error;
pub mod flash;
pub mod manager;
pub mod params;
pub mod protocol;
pub mod pubsub;
pub mod router;
pub mod server;
pub mod session;
pub mod socket;
pub mod upload;
pub mod view;

// Re-exports for convenience
pub use component::{live_component, live_component_with_id, ComponentKey, LiveComponent};
pub use connection::{Channel, Connection, Inbound};
pub use error::{CallbackResult, LiveError};
pub use flash::{FlashStore, MemoryFlashStore, CLEAR_FLASH_EVENT};
pub use manager::{LiveViewManager, Services};
pub use params::{parse_query, parse_url, url_params, url_path, Params};
pub use protocol::{Envelope, MessageKind, ProtocolError};
pub use pubsub::{BroadcastHub, HubStats, PubSub};
pub use router::{Router, ViewFactory};
pub use server::{LiveServer, ServerConfig, ServerStats};
pub use session::{JsonSessionVerifier, Session, SessionError, SessionVerifier};
pub use socket::{ComponentSocket, LiveSocket};
pub use upload::{
    ChunkFrame, ConsumedEntry, FileStager, TempDirStager, Upload, UploadConfig, UploadEntry, UploadEntryMeta,
    UploadError, Uploads,
};
pub use view::{Event, LiveView, RenderMeta};

pub use tessera_core::{html, Dynamic, Template};
