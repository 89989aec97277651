//! HTTP API Module
//!
//! Operator-facing REST API: status, queue, parts, and inserts.

mod http;

pub use http::HttpServer;
