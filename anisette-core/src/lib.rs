#![deny(clippy::all, clippy::pedantic, clippy::nursery)]

//! Anisette provisioning protocol engine.
//!
//! Negotiates a persistent per-device identity with Apple's GSA backend over
//! one of two incompatible anisette-server protocol generations and produces
//! the transient header set a client must attach to identity requests. The
//! embedding application supplies the secure identity store and the
//! legacy-server consent prompt; version negotiation, the provisioning
//! handshake, header assembly and validation all live here.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use anisette_core::{AnisetteProvider, MemoryStore};
//!
//! # async fn run() -> Result<(), anisette_core::AnisetteError> {
//! let provider =
//!     AnisetteProvider::builder("https://ani.example.com", Arc::new(MemoryStore::new()))
//!         .build();
//! let headers = provider.fetch_anisette().await?;
//! println!("{}", headers.machine_id);
//! # Ok(())
//! # }
//! ```

mod client_info;
pub use client_info::*;

mod error;
pub use error::*;

mod handshake;
pub use handshake::RetryPolicy;

mod headers;
pub use headers::{AnisetteHeaders, LocalEnvironment};

mod identity;
pub use identity::*;

mod provider;
pub use provider::*;

mod store;
pub use store::{
    MemoryStore, SecureIdentityStore, StoreError, KEY_ADI_PB, KEY_IDENTIFIER,
    KEY_TRUSTED_SERVERS,
};

mod transport;
pub use transport::{
    ProvisioningStream, StreamConnector, TransportError, WebSocketConnector,
    CONNECT_TIMEOUT,
};

pub use apple::DEFAULT_LOOKUP_URL;
pub use tokio_util::sync::CancellationToken;

// private modules
mod apple;
mod fetch;
mod http;
mod messages;
