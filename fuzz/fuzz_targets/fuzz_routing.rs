//! Fuzz testing for path pattern parsing, route resolution and prefix
//! stripping.
//!
//! Checks that for arbitrary patterns and request paths:
//!
//! - Parsing and matching never panic
//! - A resolved route always matches the path it was resolved for
//! - The forwarded path always starts with `/`
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_routing
//!
//! # With a time limit
//! cargo +nightly fuzz run fuzz_routing -- -max_total_time=60
//! ```

#![no_main]

use arbitrary::Arbitrary;
use edge_gateway::route_matcher::{
    PathPattern, RouteRule, RouteTable, has_dot_segment, strip_path_segments,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    patterns: Vec<(String, u8)>,
    path: String,
}

fuzz_target!(|input: Input| {
    let rules: Vec<RouteRule> = input
        .patterns
        .iter()
        .take(16)
        .map(|(pattern, strip)| RouteRule::new(pattern.as_str(), "svc", usize::from(*strip % 8)))
        .collect();

    for rule in &rules {
        if let Ok(pattern) = PathPattern::parse(&rule.path_pattern) {
            let _ = pattern.matches(&input.path);
        }
    }

    // A path with no dot segments keeps none after stripping.
    if !has_dot_segment(&input.path) {
        assert!(!has_dot_segment(&strip_path_segments(&input.path, 1)));
    }

    for count in 0..4 {
        assert!(strip_path_segments(&input.path, count).starts_with('/'));
    }

    if let Ok(table) = RouteTable::new(rules) {
        if let Some(resolved) = table.resolve(&input.path) {
            assert!(resolved.route.pattern.matches(&input.path));
            assert!(resolved.forward_path.starts_with('/'));
        }
    }
});
