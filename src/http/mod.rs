//! Shared HTTP plumbing: one pooled client and its error type.

mod client;
mod error;

pub use client::{
    CONNECT_TIMEOUT_SECS, HttpClient, HttpClientOptions, READ_TIMEOUT_SECS, ensure_success,
    header_value, read_prefix,
};
pub use error::HttpError;
