//! # wechat-miniprogram-mcp
//!
//! MCP (Model Context Protocol) server for WeChat Mini Program DevTools
//! automation.
//!
//! This crate provides a standards-compliant MCP server that lets AI agents
//! and other MCP clients drive a Mini Program running inside WeChat DevTools:
//! query and set page data, call page methods, find and inspect elements, and
//! manage the automation connection lifecycle.
//!
//! ## Architecture
//!
//! - **Connection manager** ([`connection`]): owns the single shared
//!   automation session. It connects lazily, caches the session across tool
//!   calls, collapses concurrent connect attempts into one, invalidates the
//!   session when the endpoint dies, and reconnects on the next call.
//! - **Driver** ([`driver`]): WebSocket client for the DevTools automation
//!   endpoint with request/response correlation, behind a trait seam so the
//!   rest of the crate never touches the transport.
//! - **Tools** ([`tools`]): thin MCP tool handlers that borrow a page handle
//!   for one scoped callback and format results.
//!
//! ## Available Tools
//!
//! - `miniprogram_connect` / `miniprogram_disconnect`: connection lifecycle
//! - `miniprogram_page_data` / `miniprogram_set_page_data`: page data access
//! - `miniprogram_call_method`: invoke page methods
//! - `miniprogram_element` / `miniprogram_elements`: element lookup, with
//!   optional raw WXML markup and attribute reads
//! - `miniprogram_wait_for` / `miniprogram_wait`: element and timed waits
//!
//! ## Usage
//!
//! Enable the automation port in WeChat DevTools (Settings > Security), then
//! register the server with an MCP client:
//!
//! ```json
//! {
//!   "servers": {
//!     "miniprogram": {
//!       "command": "miniprogram-mcp",
//!       "args": ["--port", "9420"]
//!     }
//!   }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tools;

pub use connection::{ConnectConfig, ConnectOptions, ConnectionManager};
pub use error::{Error, Result};
pub use protocol::{JsonRpcRequest, JsonRpcResponse, McpMessage};
pub use server::McpServer;
pub use tools::{Tool, ToolRegistry};
