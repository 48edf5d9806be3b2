//! Contiguous address ranges with big-integer sampling.
//!
//! Ranges and prefixes are stored as `base + size` over the address space's
//! big-endian integer form: 4 bytes for IPv4, 16 for IPv6. Sizes can reach
//! 2^128 (`::/0`), hence [`BigUint`] rather than any machine word.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use num_bigint::{BigUint, RandBigInt};

use super::AddrGen;
use crate::randpool;

/// An inclusive range of addresses of one family.
pub struct AddrRange {
    base: BigUint,
    size: BigUint,
    v6: bool,
}

impl AddrRange {
    /// Build from two inclusive endpoints of the same family.
    ///
    /// Reversed endpoints are swapped. Returns `None` when one endpoint is
    /// IPv4 and the other IPv6.
    #[must_use]
    pub fn new(start: IpAddr, end: IpAddr) -> Option<Self> {
        if start.is_ipv6() != end.is_ipv6() {
            return None;
        }
        let v6 = start.is_ipv6();
        let mut lo = addr_to_int(start);
        let mut hi = addr_to_int(end);
        if hi < lo {
            std::mem::swap(&mut lo, &mut hi);
        }
        let size = &hi - &lo + 1u32;
        Some(Self { base: lo, size, v6 })
    }

    /// Build from a CIDR prefix; the host bits define the size.
    #[must_use]
    pub fn from_prefix(prefix: &ipnet::IpNet) -> Self {
        let host_bits = usize::from(prefix.max_prefix_len() - prefix.prefix_len());
        Self {
            base: addr_to_int(prefix.network()),
            size: BigUint::from(1u8) << host_bits,
            v6: prefix.network().is_ipv6(),
        }
    }
}

impl AddrGen for AddrRange {
    fn addr(&self) -> String {
        let offset = randpool::borrow(|rng| rng.gen_biguint_below(&self.size));
        int_to_addr(&(&self.base + offset), self.v6).to_string()
    }

    fn power(&self) -> BigUint {
        self.size.clone()
    }
}

fn addr_to_int(addr: IpAddr) -> BigUint {
    match addr {
        IpAddr::V4(v4) => BigUint::from_bytes_be(&v4.octets()),
        IpAddr::V6(v6) => BigUint::from_bytes_be(&v6.octets()),
    }
}

fn int_to_addr(value: &BigUint, v6: bool) -> IpAddr {
    let bytes = value.to_bytes_be();
    if v6 {
        let mut octets = [0u8; 16];
        octets[16 - bytes.len()..].copy_from_slice(&bytes);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        let mut octets = [0u8; 4];
        octets[4 - bytes.len()..].copy_from_slice(&bytes);
        IpAddr::V4(Ipv4Addr::from(octets))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: &str, end: &str) -> AddrRange {
        AddrRange::new(start.parse().unwrap(), end.parse().unwrap()).unwrap()
    }

    #[test]
    fn range_size_is_inclusive() {
        assert_eq!(range("10.0.0.0", "10.0.0.9").power(), BigUint::from(10u32));
        assert_eq!(range("10.0.0.1", "10.0.0.1").power(), BigUint::from(1u32));
    }

    #[test]
    fn reversed_endpoints_are_swapped() {
        let r = range("10.0.0.9", "10.0.0.0");
        assert_eq!(r.power(), BigUint::from(10u32));
        for _ in 0..100 {
            let addr: IpAddr = r.addr().parse().unwrap();
            let ip = addr_to_int(addr);
            assert!(ip >= addr_to_int("10.0.0.0".parse().unwrap()));
            assert!(ip <= addr_to_int("10.0.0.9".parse().unwrap()));
        }
    }

    #[test]
    fn family_mismatch_is_refused() {
        assert!(AddrRange::new("10.0.0.1".parse().unwrap(), "::1".parse().unwrap()).is_none());
    }

    #[test]
    fn prefix_power_is_two_to_host_bits() {
        let p: ipnet::IpNet = "10.0.0.0/17".parse().unwrap();
        assert_eq!(AddrRange::from_prefix(&p).power(), BigUint::from(32768u32));

        let p: ipnet::IpNet = "::/0".parse().unwrap();
        assert_eq!(AddrRange::from_prefix(&p).power(), BigUint::from(1u8) << 128);
    }

    #[test]
    fn prefix_is_masked_before_use() {
        let p: ipnet::IpNet = "10.0.0.129/25".parse().unwrap();
        let r = AddrRange::from_prefix(&p);
        for _ in 0..100 {
            let addr: Ipv4Addr = r.addr().parse().unwrap();
            assert!(addr.octets()[3] >= 128, "sampled below the subnet: {addr}");
        }
    }

    #[test]
    fn samples_stay_inside_the_range() {
        let r = range("192.168.0.0", "192.168.255.255");
        for _ in 0..1000 {
            let addr: IpAddr = r.addr().parse().unwrap();
            match addr {
                IpAddr::V4(v4) => {
                    let [a, b, _, _] = v4.octets();
                    assert_eq!((a, b), (192, 168));
                }
                IpAddr::V6(_) => panic!("drew IPv6 from an IPv4 range"),
            }
        }
    }

    #[test]
    fn ipv6_formatting_is_canonical() {
        let r = range("2001:db8::1", "2001:db8::1");
        assert_eq!(r.addr(), "2001:db8::1");
    }
}
