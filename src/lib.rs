//! Loadgate - a TLS-terminating, load-balancing reverse proxy
//!
//! This library provides a reverse proxy that:
//! - Terminates TLS and forwards plain HTTP to a fixed set of backends
//! - Distributes requests to the backend with the fewest active connections
//! - Limits concurrent connections per source and process-wide
//! - Gates requests on origin and IP allow-lists and declared body size
//! - Streams request and response bodies without buffering
//! - Optionally polls backend `GET /info` self-reports

pub mod backend;
pub mod balancer;
pub mod config;
pub mod error;
pub mod forward;
pub mod gate;
pub mod proxy;
pub mod telemetry;
pub mod tracker;
