//! Longest-prefix matching between router candidates and local addresses.

use std::net::Ipv4Addr;

/// Number of leading bits shared by `a` and `b`, capped at 31.
///
/// The cap keeps an exact address match from outranking itself in callers
/// that treat the full 32-bit match as "same host".
fn common_prefix_len(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
    (u32::from(a) ^ u32::from(b)).leading_zeros().min(31)
}

/// Picks the candidate sharing the longest common prefix with `target`.
///
/// Ties break to the lowest index in `candidates`. Returns `None` when
/// `candidates` is empty; callers skip the target in that case.
pub(crate) fn longest_prefix_match(
    candidates: &[Ipv4Addr],
    target: Ipv4Addr,
) -> Option<Ipv4Addr> {
    let mut best: Option<(u32, Ipv4Addr)> = None;
    for &candidate in candidates {
        let len = common_prefix_len(candidate, target);
        match best {
            Some((best_len, _)) if best_len >= len => {}
            _ => best = Some((len, candidate)),
        }
    }
    best.map(|(_, candidate)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn prefers_same_subnet() {
        let candidates = [ip("192.168.1.1"), ip("10.0.0.1")];
        assert_eq!(
            longest_prefix_match(&candidates, ip("192.168.1.20")),
            Some(ip("192.168.1.1"))
        );
    }

    #[test]
    fn deterministic_across_invocations() {
        let candidates = [ip("10.0.0.1"), ip("10.0.0.2"), ip("192.168.0.1")];
        let first = longest_prefix_match(&candidates, ip("10.0.0.17"));
        for _ in 0..16 {
            assert_eq!(longest_prefix_match(&candidates, ip("10.0.0.17")), first);
        }
    }

    #[test]
    fn ties_break_to_lowest_index() {
        // 10.0.0.1 and 10.0.0.2 share the same 29-bit prefix with 10.0.0.5.
        let candidates = [ip("10.0.0.2"), ip("10.0.0.1")];
        assert_eq!(
            longest_prefix_match(&candidates, ip("10.0.0.5")),
            Some(ip("10.0.0.2"))
        );
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert_eq!(longest_prefix_match(&[], ip("192.168.1.20")), None);
    }

    #[test]
    fn exact_match_does_not_overflow_the_cap() {
        let candidates = [ip("192.168.1.20"), ip("192.168.1.21")];
        assert_eq!(
            longest_prefix_match(&candidates, ip("192.168.1.20")),
            Some(ip("192.168.1.20"))
        );
    }
}
