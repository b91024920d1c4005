//! Upstream procurement-registry access.
//!
//! * [`models`] — wire shapes and lenient per-record parsing.
//! * [`client`] — paced, retrying HTTP client for the paginated notice API.

pub mod client;
pub mod models;

pub use client::RegistryClient;
pub use models::{DateWindow, FetchMode, NoticePage, RawNotice};
