// http/mod.rs - Network transport and the request interceptor

pub mod client;
pub mod interceptor;

pub use client::{RemoteClient, Transport, TransportResponse};
pub use interceptor::{InterceptOutcome, Interceptor, RequestOptions};
