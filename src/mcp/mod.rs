//! MCP Server implementation for SAP Gateway OData
//!
//! Exposes the SAP connector as tools over JSON-RPC 2.0

pub mod protocol;
mod server;

pub use protocol::*;
pub use server::SapMcpServer;
