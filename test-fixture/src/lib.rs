// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed time base for tests, so that recovery/RTT tests can work purely
//! in terms of offsets from a single `Instant` rather than `Instant::now()`,
//! which would make expected values depend on wall-clock time.

use std::time::{Duration, Instant};

/// An arbitrary but fixed `Instant` that all the tests in this workspace
/// anchor their time arithmetic to.
#[must_use]
pub fn now() -> Instant {
    // `Instant` has no public constant constructor, so anchor on process
    // start and push forward by a constant offset; tests only ever compare
    // `now() + delta` against other `now() + delta` values, so the absolute
    // value doesn't matter.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    *START.get_or_init(Instant::now) + Duration::from_secs(60 * 60 * 24 * 365)
}
