// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::time::Duration;

pub mod logging;

pub use logging::LogFormat;

/// Return a random interval within a range
pub fn random_interval(min: Duration, max: Duration) -> Duration {
    assert!(min <= max);
    if min == max {
        return min;
    }

    use rand::distributions::Distribution;
    let dist = rand::distributions::Uniform::new(min, max);
    dist.sample(&mut rand::thread_rng())
}

/// Return `base` stretched by up to `pct` percent of random jitter.
pub fn jittered(base: Duration, pct: u32) -> Duration {
    let extra = base * pct / 100;
    random_interval(base, base + extra)
}

#[test]
fn test_random_interval() {
    let min = Duration::from_millis(10);
    let max = Duration::from_millis(20);
    for _ in 0..100 {
        let d = random_interval(min, max);
        assert!(d >= min && d < max);
    }
    assert_eq!(random_interval(min, min), min);

    let j = jittered(Duration::from_millis(100), 0);
    assert_eq!(j, Duration::from_millis(100));
    let j = jittered(Duration::from_millis(100), 50);
    assert!(j >= Duration::from_millis(100) && j < Duration::from_millis(150));
}
