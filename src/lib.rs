//! SIP user agent and signalling core.
//!
//! `sipua` implements the wire-level protocol stack beneath a call
//! application: the RFC 3261 message grammar, the four transaction state
//! machines with their timers, the dialog layer, and a registrar with
//! digest authentication. Media handling, ICE and TLS handshakes are out
//! of scope; the library exposes the signalling surface a softphone or a
//! small PBX builds on.
//!
//! The layering mirrors the RFC: bytes enter through a
//! [`transport`](crate::transport) connection, are decoded by the
//! [`message`](crate::message) codec, matched to a transaction by the
//! [`transaction::endpoint::Endpoint`], and routed to a dialog or to the
//! application through typed event channels.
//!
//! # Example
//!
//! ```rust,no_run
//! use sipua::transaction::endpoint::EndpointBuilder;
//! use sipua::transport::TransportLayer;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> sipua::Result<()> {
//! let token = CancellationToken::new();
//! let transport_layer = TransportLayer::new(token.child_token());
//! let endpoint = EndpointBuilder::new()
//!     .with_user_agent("sipua/0.1")
//!     .with_transport_layer(transport_layer)
//!     .build();
//! tokio::spawn(async move { endpoint.serve().await });
//! # Ok(())
//! # }
//! ```

mod error;

pub mod dialog;
pub mod message;
pub mod registrar;
pub mod transaction;
pub mod transport;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
