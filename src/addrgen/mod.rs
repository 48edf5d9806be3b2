//! Weighted remote endpoint generation
//!
//! The hopping client re-samples its remote endpoint for every new session
//! from a specification like:
//!
//! ```text
//! 192.168.0.0/16,10.0.0.0/8,172.16.0.0-172.31.255.255:50000-60000
//! ```
//!
//! One such clause is an *endpoint group*: a comma-separated list of address
//! terms and a port specification, split on the **last** colon. An address
//! term is a literal IP, a CIDR prefix, a closed range (`a..b`), or a domain
//! name. Each term carries a *power*: the number of addresses it covers.
//! Within a group, terms are sampled proportional to power; across groups
//! (see [`EqualMultiEndpointGen`]) sampling is uniform.
//!
//! Powers are arbitrary-precision: an IPv6 `::/0` term alone weighs 2^128,
//! so weights and cumulative sums use [`BigUint`] throughout. Host selection
//! draws a uniform big integer below the total weight and binary-searches
//! the cumulative weight vector.

mod port;
mod range;
mod single;

use std::net::IpAddr;

use num_bigint::{BigUint, RandBigInt};
use thiserror::Error;

use crate::randpool;

pub use port::{parse_port_spec, PortGen, PortRange, SinglePort};
pub use range::AddrRange;
pub use single::{DomainName, SingleAddr};

/// Errors from parsing endpoint group specifications.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// No colon separating the address list from the port specification.
    #[error("port specification not found in {0:?}: colon is missing")]
    MissingPortSpec(String),

    /// The address list before the colon was empty.
    #[error("no address terms in {0:?}")]
    EmptyAddressList(String),

    /// A single term was empty (e.g. a trailing comma).
    #[error("empty address term in {0:?}")]
    EmptyTerm(String),

    /// Port or port range did not parse.
    #[error("invalid port specification {0:?}")]
    InvalidPort(String),

    /// A CIDR prefix did not parse.
    #[error("invalid prefix {0:?}: {1}")]
    InvalidPrefix(String, ipnet::AddrParseError),

    /// A range endpoint did not parse as an IP address.
    #[error("invalid address {0:?}: {1}")]
    InvalidAddr(String, std::net::AddrParseError),

    /// Range endpoints mix IPv4 and IPv6.
    #[error("address family mismatch in range {0:?}")]
    FamilyMismatch(String),

    /// A multi-group generator needs at least one group.
    #[error("no endpoint groups provided")]
    NoGroups,
}

/// One address term: yields a host string and its selection weight.
pub trait AddrGen: Send + Sync {
    /// Draw one address (or return the literal for single terms).
    fn addr(&self) -> String;
    /// Number of distinct addresses this term covers.
    fn power(&self) -> BigUint;
}

/// A source of `host:port` endpoint strings.
pub trait EndpointGen: Send + Sync {
    /// Produce the next endpoint.
    fn endpoint(&self) -> String;
    /// Total address mass, informational.
    fn power(&self) -> BigUint;
}

/// Parse one address term: prefix, range, literal IP or domain name.
pub fn parse_addr_term(spec: &str) -> Result<Box<dyn AddrGen>, EndpointError> {
    if spec.contains('/') {
        let prefix: ipnet::IpNet = spec
            .parse()
            .map_err(|e| EndpointError::InvalidPrefix(spec.to_string(), e))?;
        if prefix.prefix_len() == prefix.max_prefix_len() {
            return Ok(Box::new(SingleAddr::new(prefix.network().to_string())));
        }
        return Ok(Box::new(AddrRange::from_prefix(&prefix)));
    }
    if let Some((start, end)) = spec.split_once("..") {
        let start: IpAddr = start
            .parse()
            .map_err(|e| EndpointError::InvalidAddr(start.to_string(), e))?;
        let end: IpAddr = end
            .parse()
            .map_err(|e| EndpointError::InvalidAddr(end.to_string(), e))?;
        let range = AddrRange::new(start, end)
            .ok_or_else(|| EndpointError::FamilyMismatch(spec.to_string()))?;
        return Ok(Box::new(range));
    }
    match spec.parse::<IpAddr>() {
        Ok(addr) => Ok(Box::new(SingleAddr::new(addr.to_string()))),
        Err(_) => Ok(Box::new(DomainName::new(spec.to_string()))),
    }
}

/// One endpoint group: weighted address terms plus a port specification.
pub struct AddrSet {
    ports: Box<dyn PortGen>,
    terms: Vec<Box<dyn AddrGen>>,
    cum_weights: Vec<BigUint>,
}

impl AddrSet {
    /// Parse a group specification (`terms:port-spec`).
    pub fn parse(spec: &str) -> Result<Self, EndpointError> {
        let (addr_part, port_part) = spec
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::MissingPortSpec(spec.to_string()))?;
        if addr_part.is_empty() {
            return Err(EndpointError::EmptyAddressList(spec.to_string()));
        }
        let ports = parse_port_spec(port_part)?;

        let mut terms: Vec<Box<dyn AddrGen>> = Vec::new();
        for term_spec in addr_part.split(',') {
            if term_spec.is_empty() {
                return Err(EndpointError::EmptyTerm(spec.to_string()));
            }
            terms.push(parse_addr_term(term_spec)?);
        }

        let mut cum_weights = Vec::with_capacity(terms.len());
        let mut sum = BigUint::default();
        for term in &terms {
            sum += term.power();
            cum_weights.push(sum.clone());
        }

        Ok(Self {
            ports,
            terms,
            cum_weights,
        })
    }
}

impl EndpointGen for AddrSet {
    fn endpoint(&self) -> String {
        let total = self
            .cum_weights
            .last()
            .expect("parse guarantees at least one term");
        let drawn = randpool::borrow(|rng| rng.gen_biguint_below(total));
        // First cumulative weight strictly above the draw owns it.
        let idx = self.cum_weights.partition_point(|w| w <= &drawn);
        let host = self.terms[idx].addr();
        let port = self.ports.port();
        join_host_port(&host, port)
    }

    fn power(&self) -> BigUint {
        self.cum_weights
            .last()
            .cloned()
            .unwrap_or_default()
    }
}

/// Several endpoint groups sampled with equal probability.
///
/// Group powers intentionally do not bias selection: a group listing a /8
/// and a group listing one domain are hit equally often.
pub struct EqualMultiEndpointGen {
    groups: Vec<Box<dyn EndpointGen>>,
}

impl EqualMultiEndpointGen {
    pub fn new(groups: Vec<Box<dyn EndpointGen>>) -> Result<Self, EndpointError> {
        if groups.is_empty() {
            return Err(EndpointError::NoGroups);
        }
        Ok(Self { groups })
    }

    /// Build from raw group specifications.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, EndpointError> {
        let mut groups: Vec<Box<dyn EndpointGen>> = Vec::with_capacity(specs.len());
        for spec in specs {
            groups.push(Box::new(AddrSet::parse(spec.as_ref())?));
        }
        Self::new(groups)
    }
}

impl EndpointGen for EqualMultiEndpointGen {
    fn endpoint(&self) -> String {
        let idx = randpool::borrow(|rng| rand::Rng::gen_range(rng, 0..self.groups.len()));
        self.groups[idx].endpoint()
    }

    fn power(&self) -> BigUint {
        self.groups.iter().map(|g| g.power()).sum()
    }
}

/// A fixed endpoint, used by the non-hopping client.
pub struct SingleEndpoint(pub String);

impl EndpointGen for SingleEndpoint {
    fn endpoint(&self) -> String {
        self.0.clone()
    }

    fn power(&self) -> BigUint {
        BigUint::from(1u32)
    }
}

/// Join host and port, bracketing IPv6 literals.
#[must_use]
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Split an endpoint string into host and port, unbracketing IPv6 literals.
pub fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Some((host, port))
}
