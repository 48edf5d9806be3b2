//! Per-session remote dialing
//!
//! The client opens a fresh local UDP socket for every session and points it
//! at an endpoint obtained from its generator *at dial time*, so a hopping
//! generator takes effect per session. Host names resolve through the
//! system resolver on every call; the first resolved address wins. Ports
//! are numeric or UDP service names looked up in the system services
//! database.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::debug;
use webrtc_util::conn::Conn;

use crate::addrgen::EndpointGen;

/// Path of the system services database consulted for service-name ports.
const SERVICES_FILE: &str = "/etc/services";

/// Dialing failures. Each ends only the session being established.
#[derive(Debug, Error)]
pub enum DialError {
    /// Endpoint string was not `host:port`.
    #[error("malformed endpoint {0:?}")]
    MalformedEndpoint(String),

    /// DNS returned no usable address.
    #[error("no addresses resolved for {0:?}")]
    NoAddresses(String),

    /// DNS lookup failed.
    #[error("address lookup for {host:?} failed: {source}")]
    Lookup {
        host: String,
        source: std::io::Error,
    },

    /// Reading the services database failed.
    #[error("service lookup for {service:?} failed: {source}")]
    ServiceLookup {
        service: String,
        source: std::io::Error,
    },

    /// Port is neither numeric nor a known UDP service name.
    #[error("unknown UDP service {0:?}")]
    UnknownService(String),

    /// Local socket creation or connect failed.
    #[error("UDP socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
}

/// Dials the endpoint its generator currently points at.
pub struct DynDialer {
    endpoints: Arc<dyn EndpointGen>,
}

impl DynDialer {
    #[must_use]
    pub fn new(endpoints: Arc<dyn EndpointGen>) -> Self {
        Self { endpoints }
    }

    /// Open a connected UDP socket to a freshly selected endpoint.
    ///
    /// The caller bounds this with its dial deadline; DNS, service and
    /// socket setup all count against it.
    pub async fn dial(&self) -> Result<(Arc<dyn Conn + Send + Sync>, SocketAddr), DialError> {
        let endpoint = self.endpoints.endpoint();
        let (host, port) = split_endpoint(&endpoint)
            .ok_or_else(|| DialError::MalformedEndpoint(endpoint.clone()))?;
        let port = resolve_port(port).await?;

        let remote = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => resolve_host(host, port).await?,
        };

        let local: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid any-address")
        } else {
            "[::]:0".parse().expect("valid any-address")
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        debug!(endpoint = %endpoint, resolved = %remote, "dialed remote");

        Ok((Arc::new(socket), remote))
    }
}

/// Split an endpoint on its last colon, unbracketing IPv6 literals. The
/// port part is kept verbatim so service names survive.
fn split_endpoint(endpoint: &str) -> Option<(&str, &str)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    if host.is_empty() || port.is_empty() {
        return None;
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}

async fn resolve_host(host: &str, port: u16) -> Result<SocketAddr, DialError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| DialError::Lookup {
            host: host.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| DialError::NoAddresses(host.to_string()))
}

/// Resolve a port specification: numeric, or a UDP service name.
async fn resolve_port(port: &str) -> Result<u16, DialError> {
    if let Ok(numeric) = port.parse::<u16>() {
        return Ok(numeric);
    }
    let services = tokio::fs::read_to_string(SERVICES_FILE)
        .await
        .map_err(|source| DialError::ServiceLookup {
            service: port.to_string(),
            source,
        })?;
    find_udp_service(&services, port).ok_or_else(|| DialError::UnknownService(port.to_string()))
}

/// Scan services-database text for a UDP entry matching `name` (service
/// name or alias). Lines are `name port/proto [aliases...] [# comment]`.
fn find_udp_service(services: &str, name: &str) -> Option<u16> {
    for line in services.lines() {
        let line = line.split('#').next().unwrap_or("");
        let mut fields = line.split_whitespace();
        let Some(service) = fields.next() else {
            continue;
        };
        let Some(port_proto) = fields.next() else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        if !proto.eq_ignore_ascii_case("udp") {
            continue;
        }
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        if service == name || fields.any(|alias| alias == name) {
            return Some(port);
        }
    }
    None
}
