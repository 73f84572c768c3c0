//! MCP adapter - JSON-RPC 2.0 over stdio
//!
//! # Architecture
//!
//! ```text
//! stdin ──lines──► McpServer ──tools/call──► tokio task ──► FeedbackTool::invoke_until
//!                     │  ▲                        │                 ▲
//!                     │  └──── response ◄─────────┘                 │
//!                     │                                             │
//!                     └── notifications/cancelled ──► abort ────────┘
//!                     │
//! stdout ◄──lines─────┘
//! ```

pub mod server;

pub use server::{error_code, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpServer};
