//! Request admission: origin, source identity, IP allow-list, connection
//! limits, declared payload size
//!
//! Every request passes through [`admit`] before any upstream work
//! happens. Checks run in a fixed order and the first failure produces
//! the rejection; an admitted request carries the tracker charge as a
//! guard so the count is released exactly once no matter how the
//! exchange ends.

use crate::config::ProxyConfig;
use crate::error::{error_response, ProxyErrorCode};
use crate::tracker::{ConnectionTracker, TrackerGuard};
use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_LENGTH, ORIGIN};
use hyper::{Request, Response};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// A request that passed every admission check.
#[derive(Debug)]
pub struct Admission {
    pub source_key: String,
    /// Held for the lifetime of the proxied exchange
    pub charge: TrackerGuard,
    pub origin: Option<HeaderValue>,
}

/// A refused request, ready to be turned into a wire response.
#[derive(Debug)]
pub struct Rejection {
    pub code: ProxyErrorCode,
    pub message: String,
    pub origin: Option<HeaderValue>,
}

impl Rejection {
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        error_response(self.code, self.message, self.origin.as_ref())
    }
}

#[derive(Debug)]
pub enum AdmissionDecision {
    Admitted(Admission),
    Rejected(Rejection),
}

/// Run the admission checks for one request.
///
/// Order: origin allow-list, source identity, IP allow-list, connection
/// limits (charge first, verify after, release on failure), declared
/// content length. The admitting connection counts toward its own limit
/// check, so a per-source limit of N admits at most N concurrent
/// requests.
pub fn admit<B>(
    config: &ProxyConfig,
    tracker: &Arc<ConnectionTracker>,
    req: &Request<B>,
    remote_addr: SocketAddr,
) -> AdmissionDecision {
    let origin = req.headers().get(ORIGIN).cloned();

    if let Some(allowed) = &config.allowed_origins {
        let permitted = origin
            .as_ref()
            .and_then(|o| o.to_str().ok())
            .is_some_and(|o| allowed.contains(o));
        if !permitted {
            let shown = origin
                .as_ref()
                .map(|o| String::from_utf8_lossy(o.as_bytes()).into_owned())
                .unwrap_or_default();
            debug!(origin = %shown, "origin rejected");
            return AdmissionDecision::Rejected(Rejection {
                code: ProxyErrorCode::OriginDenied,
                message: format!("Access from origin {shown} denied."),
                origin,
            });
        }
    }

    let source_key = match source_key(config, req, remote_addr) {
        Some(key) => key,
        None => {
            return AdmissionDecision::Rejected(Rejection {
                code: ProxyErrorCode::SourceUndetectable,
                message: "Request source cannot be determined.".to_string(),
                origin,
            })
        }
    };

    if let Some(allowed) = &config.allowed_ips {
        let permitted = source_key
            .parse::<IpAddr>()
            .is_ok_and(|ip| allowed.contains(&ip));
        if !permitted {
            debug!(source = %source_key, "ip rejected");
            return AdmissionDecision::Rejected(Rejection {
                code: ProxyErrorCode::IpDenied,
                message: format!("Access from IP address {source_key} denied."),
                origin,
            });
        }
    }

    // Charge before verifying so the admitting connection counts toward
    // its own limit; on refusal the charge is released right away since
    // the connection never proceeds.
    let charge = tracker.add(&source_key);
    if !tracker.verify(&source_key) {
        drop(charge);
        debug!(source = %source_key, "connection limit rejected");
        return AdmissionDecision::Rejected(Rejection {
            code: ProxyErrorCode::ConnectionLimitExceeded,
            message: "Connection refused: limit overflowed.".to_string(),
            origin,
        });
    }

    if let Some(max) = config.max_req_bytes {
        // Declared length exactly at the limit is admitted; an
        // unparseable declaration is treated as absent
        if declared_content_length(req).is_some_and(|len| len > max) {
            drop(charge);
            return AdmissionDecision::Rejected(Rejection {
                code: ProxyErrorCode::PayloadTooLarge,
                message: "Req. size limit overflowed.".to_string(),
                origin,
            });
        }
    }

    AdmissionDecision::Admitted(Admission {
        source_key,
        charge,
        origin,
    })
}

/// Source identity: the configured header's value when present and
/// non-empty, otherwise the peer IP address.
fn source_key<B>(
    config: &ProxyConfig,
    req: &Request<B>,
    remote_addr: SocketAddr,
) -> Option<String> {
    if let Some(header) = &config.source_id_header {
        if let Some(value) = req.headers().get(header.as_str()) {
            let key = value.to_str().ok()?.trim();
            if key.is_empty() {
                return None;
            }
            return Some(key.to_string());
        }
    }
    Some(remote_addr.ip().to_string())
}

fn declared_content_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}
