//! Statistical properties of the weighted endpoint generator.
//!
//! These tests draw large samples and assert convergence with generous
//! bands (5 sigma or wider), so they are stable across seeds.

use dtlspipe::addrgen::{split_host_port, AddrSet, EndpointGen, EqualMultiEndpointGen};

/// Classify a drawn host into one of the two terms of the spec below.
fn classify(host: &str) -> &'static str {
    if host.starts_with("10.") {
        "prefix"
    } else if host.starts_with("192.168.") {
        "range"
    } else {
        panic!("host {host:?} belongs to neither term");
    }
}

#[test]
fn term_mass_is_proportional_to_power() {
    // 10.0.0.0/17 has power 2^15 = 32768, the range has 65536: exactly 1:2.
    let set = AddrSet::parse("10.0.0.0/17,192.168.0.0..192.168.255.255:20000-50000").unwrap();

    const N: usize = 100_000;
    let mut prefix_hits = 0usize;
    for _ in 0..N {
        let endpoint = set.endpoint();
        let (host, _port) = split_host_port(&endpoint).unwrap();
        if classify(host) == "prefix" {
            prefix_hits += 1;
        }
    }

    // p = 1/3; five sigma at N = 100_000 is ~745.
    let expected = N / 3;
    let tolerance = 750;
    assert!(
        (expected - tolerance..=expected + tolerance).contains(&prefix_hits),
        "prefix term drew {prefix_hits}, expected {expected} +/- {tolerance}"
    );
}

#[test]
fn range_vs_prefix_ratio_matches_two_to_one() {
    let set = AddrSet::parse("10.0.0.0/17,192.168.0.0..192.168.255.255:20000-50000").unwrap();

    let mut range_hits = 0usize;
    let mut prefix_hits = 0usize;
    for _ in 0..2000 {
        let endpoint = set.endpoint();
        let (host, _) = split_host_port(&endpoint).unwrap();
        match classify(host) {
            "range" => range_hits += 1,
            _ => prefix_hits += 1,
        }
    }

    let ratio = range_hits as f64 / prefix_hits as f64;
    assert!(
        (1.7..=2.3).contains(&ratio),
        "range:prefix ratio {ratio:.2} outside [1.7, 2.3]"
    );
}

#[test]
fn ports_cover_the_range_uniformly() {
    let set = AddrSet::parse("10.0.0.1:20000-50000").unwrap();

    const N: usize = 100_000;
    const BUCKETS: usize = 10;
    let mut buckets = [0usize; BUCKETS];
    for _ in 0..N {
        let endpoint = set.endpoint();
        let (_, port) = split_host_port(&endpoint).unwrap();
        assert!((20000..=50000).contains(&port), "port {port} out of range");
        let offset = usize::from(port - 20000);
        buckets[(offset * BUCKETS) / 30001] += 1;
    }

    // Each bucket expects ~10_000; allow +/- 10%.
    for (i, &count) in buckets.iter().enumerate() {
        assert!(
            (9_000..=11_000).contains(&count),
            "bucket {i} occupancy {count} outside [9000, 11000]"
        );
    }
}

#[test]
fn groups_are_sampled_uniformly_regardless_of_power() {
    // A /8 group (power 2^24) against a single address (power 1).
    let gen =
        EqualMultiEndpointGen::from_specs(&["10.0.0.0/8:443", "192.168.1.1:443"]).unwrap();

    const N: usize = 20_000;
    let mut single_hits = 0usize;
    for _ in 0..N {
        let endpoint = gen.endpoint();
        let (host, _) = split_host_port(&endpoint).unwrap();
        if host == "192.168.1.1" {
            single_hits += 1;
        }
    }

    // p = 1/2; five sigma at N = 20_000 is ~354.
    assert!(
        (9_600..=10_400).contains(&single_hits),
        "single-address group drew {single_hits} of {N}"
    );
}

#[test]
fn ipv6_prefixes_sample_canonical_addresses() {
    let set = AddrSet::parse("2001:db8:aaaa::/48:443").unwrap();
    for _ in 0..1000 {
        let endpoint = set.endpoint();
        let (host, port) = split_host_port(&endpoint).unwrap();
        assert_eq!(port, 443);
        let addr: std::net::Ipv6Addr = host.parse().expect("canonical IPv6 text");
        assert_eq!(addr.segments()[0], 0x2001);
        assert_eq!(addr.segments()[1], 0xdb8);
        assert_eq!(addr.segments()[2], 0xaaaa);
        // RFC 5952: lowercase, shortest form is whatever Ipv6Addr displays.
        assert_eq!(host, addr.to_string());
    }
}
