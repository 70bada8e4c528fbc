//! OAI-PMH 2.0 client - issue protocol verbs against a repository and get
//! typed responses back.
//!
//! Every verb returns a [`ResponseEnvelope`] holding the raw XML, the
//! repository's protocol errors (one [`ProtocolErrorKind`] per OAI-PMH error
//! code) and, for list verbs, the resumption token. Transport failures are
//! retried with exponential backoff inside the HTTP layer.
//!
//! # Example
//!
//! ```
//! use oai_client::config;
//! use oai_client::Verb;
//!
//! let url = config::verb_url("https://repository.example.org/oai/request", Verb::Identify, &[]);
//! assert_eq!(
//!     url.unwrap(),
//!     "https://repository.example.org/oai/request?verb=Identify"
//! );
//! ```
//!
//! # Architecture
//!
//! - [`config`]: Constants, client settings and validation
//! - [`types`]: Protocol vocabulary (verbs, error kinds, headers, tokens)
//! - [`error`]: Error types and Result alias
//! - [`http`]: HTTP layer with retry and flow control
//! - [`response`]: Response envelope and parsing
//! - [`client`]: The [`OaiTransport`] trait and its HTTP implementation
//! - [`xml`]: XML utilities

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod response;
pub mod types;
pub mod xml;

pub use client::{OaiClient, OaiTransport};
pub use config::ClientConfig;
pub use error::{OaiError, Result};
pub use response::ResponseEnvelope;
pub use types::{
    DeletedRecordPolicy, Granularity, ListRecordsRequest, MetadataFormat, OaiRecord, OaiSet,
    ProtocolError, ProtocolErrorKind, RecordHeader, RepositoryIdentity, ResumptionToken, Verb,
};
