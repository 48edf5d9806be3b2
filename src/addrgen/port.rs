//! Port specifications: a single port or an inclusive range.

use rand::Rng;

use super::EndpointError;
use crate::randpool;

/// A source of ports for endpoint construction.
pub trait PortGen: Send + Sync {
    /// Draw one port.
    fn port(&self) -> u16;
    /// Number of distinct ports this spec covers.
    fn power(&self) -> u32;
}

/// An inclusive port range `lo-hi`.
///
/// Reversed bounds are normalized by swapping. The count is kept as `u32`
/// since the full range `0-65535` covers 65536 ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    base: u16,
    count: u32,
}

impl PortRange {
    #[must_use]
    pub fn new(start: u16, end: u16) -> Self {
        let (start, end) = if end < start { (end, start) } else { (start, end) };
        Self {
            base: start,
            count: u32::from(end - start) + 1,
        }
    }
}

impl PortGen for PortRange {
    fn port(&self) -> u16 {
        let delta = randpool::borrow(|rng| rng.gen_range(0..self.count));
        self.base + u16::try_from(delta).expect("delta below port range size")
    }

    fn power(&self) -> u32 {
        self.count
    }
}

/// A fixed single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglePort(pub u16);

impl PortGen for SinglePort {
    fn port(&self) -> u16 {
        self.0
    }

    fn power(&self) -> u32 {
        1
    }
}

/// Parse a port spec: `443` or `20000-50000`.
pub fn parse_port_spec(spec: &str) -> Result<Box<dyn PortGen>, EndpointError> {
    let invalid = || EndpointError::InvalidPort(spec.to_string());
    match spec.split_once('-') {
        None => {
            let port: u16 = spec.parse().map_err(|_| invalid())?;
            Ok(Box::new(SinglePort(port)))
        }
        Some((start, end)) => {
            let start: u16 = start.parse().map_err(|_| invalid())?;
            let end: u16 = end.parse().map_err(|_| invalid())?;
            Ok(Box::new(PortRange::new(start, end)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_port_is_constant() {
        let p = SinglePort(443);
        assert_eq!(p.power(), 1);
        for _ in 0..10 {
            assert_eq!(p.port(), 443);
        }
    }

    #[test]
    fn range_draws_stay_inclusive() {
        let r = PortRange::new(20000, 20009);
        assert_eq!(r.power(), 10);
        for _ in 0..1000 {
            let p = r.port();
            assert!((20000..=20009).contains(&p));
        }
    }

    #[test]
    fn range_occupies_every_bucket() {
        let r = PortRange::new(100, 107);
        let mut seen = [false; 8];
        for _ in 0..2000 {
            seen[usize::from(r.port() - 100)] = true;
        }
        assert!(seen.iter().all(|&s| s), "buckets missed: {seen:?}");
    }

    #[test]
    fn reversed_range_is_normalized() {
        assert_eq!(PortRange::new(50, 10), PortRange::new(10, 50));
    }

    #[test]
    fn full_range_power_does_not_overflow() {
        assert_eq!(PortRange::new(0, 65535).power(), 65536);
    }

    #[test]
    fn spec_parsing() {
        assert_eq!(parse_port_spec("443").unwrap().power(), 1);
        assert_eq!(parse_port_spec("1-65535").unwrap().power(), 65535);
        assert!(parse_port_spec("").is_err());
        assert!(parse_port_spec("http").is_err());
        assert!(parse_port_spec("1-2-3").is_err());
        assert!(parse_port_spec("70000").is_err());
    }
}
