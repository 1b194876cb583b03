//! Timing measurement helper.

use std::time::Instant;

/// Wall-clock duration of a closure, in nanoseconds.
pub fn time_of(f: impl FnOnce()) -> u64 {
    let start = Instant::now();
    f();
    start.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn measures_at_least_the_sleep() {
        let elapsed = time_of(|| std::thread::sleep(Duration::from_millis(10)));
        assert!(elapsed >= 10_000_000);
    }

    #[test]
    fn empty_closure_is_fast() {
        let elapsed = time_of(|| {});
        assert!(elapsed < 1_000_000_000);
    }
}
