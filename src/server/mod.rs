//! HTTP presentation layer.
//!
//! - [`api`]: Routes, request/response types and handlers
//! - [`page`]: The embedded single-page UI

pub mod api;
pub mod page;
