//! Destination host matching.
//!
//! Patterns are either exact (`www.example.com`) or wildcard
//! (`*.example.com`). A wildcard matches any host whose trailing labels
//! equal the pattern's labels and which has at least one extra leading
//! label: `*.a.b` matches `x.a.b` and `y.z.a.b` but not `a.b` itself.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// An exact or wildcard destination-host pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern {
    /// Domain without the `*.` prefix.
    domain: String,

    /// Number of labels in `domain`.
    domain_len: usize,

    /// True when the pattern was written with a leading `*.`.
    wild: bool,
}

impl HostPattern {
    /// Parse a pattern string (`host` or `*.host`).
    pub fn new(pattern: &str) -> Self {
        if let Some(rest) = pattern.strip_prefix("*.") {
            Self {
                domain: rest.to_string(),
                domain_len: rest.split('.').count(),
                wild: true,
            }
        } else {
            Self {
                domain: pattern.to_string(),
                domain_len: pattern.split('.').count(),
                wild: false,
            }
        }
    }

    /// Check whether a host matches this pattern.
    pub fn matches(&self, host: &str) -> bool {
        if !self.wild {
            return self.domain == host;
        }
        let labels: Vec<&str> = host.split('.').collect();
        if labels.len() <= self.domain_len {
            // The bare domain does not match its own wildcard.
            return false;
        }
        let tail = labels[labels.len() - self.domain_len..].join(".");
        tail == self.domain
    }

    /// True for `*.`-prefixed patterns.
    pub fn is_wild(&self) -> bool {
        self.wild
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wild {
            write!(f, "*.{}", self.domain)
        } else {
            write!(f, "{}", self.domain)
        }
    }
}

/// A blocked destination pattern with a hit counter.
///
/// The admin API can switch a block entry off and back on at runtime;
/// a disabled entry never matches.
#[derive(Debug)]
pub struct BlockHost {
    pattern: HostPattern,
    blocked: AtomicU64,
    enabled: AtomicBool,
}

impl BlockHost {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: HostPattern::new(pattern),
            blocked: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Check the host against this entry and count the hit on match.
    pub fn matches(&self, host: &str) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        if self.pattern.matches(host) {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Number of requests this entry has blocked.
    pub fn blocked(&self) -> u64 {
        self.blocked.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn pattern(&self) -> &HostPattern {
        &self.pattern
    }
}

impl fmt::Display for BlockHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Exact Pattern Tests
    // ========================================================================

    #[test]
    fn test_exact_match_same() {
        let pattern = HostPattern::new("www.example.com");
        assert!(pattern.matches("www.example.com"));
        assert!(!pattern.is_wild());
    }

    #[test]
    fn test_exact_no_subdomain() {
        let pattern = HostPattern::new("example.com");
        assert!(!pattern.matches("sub.example.com"));
        assert!(!pattern.matches("www.example.com"));
    }

    #[test]
    fn test_exact_no_parent() {
        let pattern = HostPattern::new("sub.example.com");
        assert!(!pattern.matches("example.com"));
    }

    // ========================================================================
    // Wildcard Pattern Tests
    // ========================================================================

    #[test]
    fn test_wildcard_one_level() {
        let pattern = HostPattern::new("*.a.b");
        assert!(pattern.matches("x.a.b"));
        assert!(pattern.is_wild());
    }

    #[test]
    fn test_wildcard_deep_subdomain() {
        let pattern = HostPattern::new("*.a.b");
        assert!(pattern.matches("y.z.a.b"));
    }

    #[test]
    fn test_wildcard_not_bare_domain() {
        let pattern = HostPattern::new("*.a.b");
        assert!(!pattern.matches("a.b"));
    }

    #[test]
    fn test_wildcard_different_domain() {
        let pattern = HostPattern::new("*.a.b");
        assert!(!pattern.matches("a.c"));
        assert!(!pattern.matches("x.a.c"));
    }

    #[test]
    fn test_wildcard_shorter_host() {
        let pattern = HostPattern::new("*.long.example.com");
        assert!(!pattern.matches("com"));
        assert!(!pattern.matches("example.com"));
    }

    #[test]
    fn test_wildcard_suffix_must_align_on_labels() {
        // "notexample.com" ends with "example.com" as a string but not
        // on a label boundary.
        let pattern = HostPattern::new("*.example.com");
        assert!(!pattern.matches("x.notexample.com"));
    }

    // ========================================================================
    // Display Tests
    // ========================================================================

    #[test]
    fn test_display_roundtrip_exact() {
        let pattern = HostPattern::new("www.example.com");
        assert_eq!(pattern.to_string(), "www.example.com");
    }

    #[test]
    fn test_display_roundtrip_wildcard() {
        let pattern = HostPattern::new("*.example.com");
        assert_eq!(pattern.to_string(), "*.example.com");
    }

    // ========================================================================
    // BlockHost Tests
    // ========================================================================

    #[test]
    fn test_block_host_counts_hits() {
        let block = BlockHost::new("ads.test");
        assert!(block.matches("ads.test"));
        assert!(block.matches("ads.test"));
        assert!(!block.matches("other.test"));
        assert_eq!(block.blocked(), 2);
    }

    #[test]
    fn test_block_host_wildcard() {
        let block = BlockHost::new("*.tracker.test");
        assert!(block.matches("a.tracker.test"));
        assert!(!block.matches("tracker.test"));
    }

    #[test]
    fn test_block_host_disabled_never_matches() {
        let block = BlockHost::new("ads.test");
        block.set_enabled(false);
        assert!(!block.matches("ads.test"));
        assert_eq!(block.blocked(), 0);

        block.set_enabled(true);
        assert!(block.matches("ads.test"));
        assert_eq!(block.blocked(), 1);
    }
}
