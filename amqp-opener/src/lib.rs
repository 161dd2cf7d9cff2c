//! Open [`amqprs::connection::Connection`]s from a URL, with optional
//! TLS and PLAIN or EXTERNAL authentication.
//!
//! Configure a [`ConnectionBuilder`], turn it into an [`Opener`] and
//! open as many connections as needed from it.
//!
//! # Examples
//! Username and password, with heartbeats every 30 seconds
//! ```rust
//! # fn main() -> miette::Result<()>{
//! use amqp_opener::ConnectionBuilder;
//! let opener = ConnectionBuilder::new("amqp://127.0.0.1:5672/%2f")
//!     .plain_auth("guest")
//!     .with_password("guest")
//!     .heartbeat(30)
//!     .opener()?;
//! assert_eq!(opener.virtual_host(), "/");
//! # Ok(())}
//! ```
//!
//! A client certificate instead of a password
//! ```rust,no_run
//! # fn main() -> miette::Result<()>{
//! # use amqp_opener::ConnectionBuilder;
//! let opener = ConnectionBuilder::new("amqps://127.0.0.1:5671/%2f")
//!    .external_auth()
//!    .with_ca_pem("../test_all/tls-gen/basic/result/ca_certificate.pem")
//!    .with_client_cert(
//!        "../test_all/tls-gen/basic/result/client_certificate.pem",
//!        "../test_all/tls-gen/basic/result/client_key.pem",
//!    )
//!    .opener()?;
//! # Ok(())}
//! ```
//!
//! [`Opener::open`] connects once per call. A failed attempt is
//! returned as is; reconnecting is up to the caller.
//!
//! # TLS
//!
//! TLS is provided by `amqprs` (rustls). Certificates and keys must
//! be PEM formatted. Without a CA certificate the bundled web PKI
//! roots are used.
//!
//! # Command line programs
//! The `clap` feature adds [`ConnectionArgs`], a set of options to
//! flatten into a `clap::Parser`. Its
//! [`ConnectionArgs::connection_opener`] builds the [`Opener`]
//! described by the parsed options.
//!
//! ## Feature flags
#![doc = document_features::document_features!()]
// clippy lints
#![deny(missing_docs)]
#![allow(clippy::module_name_repetitions, clippy::single_match_else)]
#![warn(
    clippy::missing_docs_in_private_items,
    clippy::self_named_module_files,
    clippy::perf,
    clippy::missing_panics_doc,
    clippy::wildcard_imports,
    clippy::enum_glob_use
)]
#![cfg_attr(all(doc, CHANNEL_NIGHTLY), feature(doc_auto_cfg))]

mod builder;
mod connection;
/// Options collected by the builder
mod options;

#[cfg(feature = "clap")]
/// Command line options
mod cli;

pub use builder::ConnectionBuilder;
pub use connection::Error;

/// Factory to open new connections to a fixed RabbitMQ server
///
/// # Examples
/// ```rust
/// # fn main() -> miette::Result<()> {
/// use amqp_opener::ConnectionBuilder;
/// let opener = ConnectionBuilder::new("amqps://rabbit.example/%2fjobs").opener()?;
/// assert!(opener.uses_tls());
/// assert_eq!(opener.port(), 5671);
/// assert_eq!(opener.virtual_host(), "/jobs");
/// # Ok(()) }
/// ```
pub use connection::Opener;

// Re-export amqprs so callers use the same version
pub use amqprs;

#[cfg(feature = "clap")]
/// Connection options for a `clap` parser
pub use cli::ConnectionArgs;
