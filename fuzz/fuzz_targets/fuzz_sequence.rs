//! Fuzz target for sequence ordering.
//!
//! Comparison must never panic on arbitrary tokens and must stay a total
//! order.

#![no_main]

use feed_replicator::Sequence;
use libfuzzer_sys::fuzz_target;
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str, &str)| {
    let (a, b, c) = (Sequence::from(data.0), Sequence::from(data.1), Sequence::from(data.2));

    assert_eq!(a.cmp(&a), Ordering::Equal);
    assert_eq!(a.cmp(&b), b.cmp(&a).reverse());

    // Equal only for identical tokens
    if a.cmp(&b) == Ordering::Equal {
        assert_eq!(a.as_str(), b.as_str());
    }

    if a <= b && b <= c {
        assert!(a <= c);
    }
});
