//! OData module
//!
//! Session handling, query engine and response normalization for SAP
//! Gateway OData v2 services

pub mod client;
pub mod normalize;
pub mod session;

pub use client::{format_key_literal, key_segment, ODataError, QueryOptions, SapClient};
pub use normalize::{normalize, OutputFormat};
pub use session::{AuthContext, Session, SessionState};
