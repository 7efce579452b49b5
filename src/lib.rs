//! Realtime Store - client-side sync runtime
//!
//! Keeps a local projection of server-held tabular state synchronized over a
//! persistent bidirectional connection, and publishes mutations that resolve
//! on acknowledgement.
//!
//! - [`session::SyncSession`]: connection lifecycle, handshake, reconnect and
//!   inbound dispatch.
//! - [`state::Projection`]: per-module, per-table rows, with the read surface
//!   in [`query`].
//! - [`correlator`]: mutation requests and their acknowledgements.
//! - [`bus::StatusBus`]: notifications for consumers.

pub mod bus;
pub mod cache;
pub mod config;
pub mod correlator;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod query;
pub mod registry;
pub mod session;
pub mod state;
pub mod transport;
pub mod utils;

pub use bus::{Channel, Notification, StatusBus};
pub use config::StoreConfig;
pub use correlator::{Ack, AckFuture};
pub use error::{ErrorKind, Result, SyncError};
pub use identity::RecordRef;
pub use query::Filter;
pub use registry::SessionRegistry;
pub use session::{SessionStatus, SyncSession};
pub use state::{ModuleState, Projection};
