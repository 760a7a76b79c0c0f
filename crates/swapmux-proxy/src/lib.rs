#![deny(unsafe_code)]

pub mod error;
pub mod forward;
pub mod management;
pub mod models;
pub mod scan;
pub mod server;
pub mod sse;

pub use server::{router, serve, ProxyState};
