use chrono::{TimeDelta, TimeZone, Utc};
use ratewarden::{
    ClientStateStore, Decision, FixedWindowLimiter, LimiterError, ManualClock, RateLimitConfig,
    RateLimiter, ShardedStore,
};
use std::convert::Infallible;
use std::time::Duration;

fn config(max: u64, block: Duration) -> RateLimitConfig {
    RateLimitConfig::default().with_max_requests(max).with_block(block)
}

#[test]
fn three_then_blocked_then_recovered_on_real_clock() {
    let limiter = FixedWindowLimiter::new(config(3, Duration::from_secs(1)));

    for n in 1..=3 {
        let d = limiter.check_now("client");
        assert!(d.is_allowed(), "request {n} should pass");
        assert_eq!(d.requests_made(), n);
    }

    let d = limiter.check_now("client");
    assert!(!d.is_allowed());
    assert_eq!(d.requests_made(), 4);
    assert_eq!(d.retry_after_secs(), Some(1));

    assert!(!limiter.check_now("client").is_allowed(), "still blocked");

    std::thread::sleep(Duration::from_millis(1100));
    let d = limiter.check_now("client");
    assert!(d.is_allowed());
    assert_eq!(d.requests_made(), 1);
}

#[test]
fn block_and_window_recovery_with_manual_clock() {
    let start = Utc.with_ymd_and_hms(2025, 2, 6, 14, 30, 0).unwrap();
    let clock = ManualClock::starting_at(start);
    let limiter = FixedWindowLimiter::new(
        config(2, Duration::from_secs(30)).with_window(Duration::from_secs(10)),
    )
    .with_clock(clock.clone());

    assert!(limiter.check_now("a").is_allowed());
    clock.advance(Duration::from_secs(10));
    // Window elapsed: count restarts even though no block was ever set.
    assert_eq!(limiter.check_now("a").requests_made(), 1);
    assert_eq!(limiter.check_now("a").requests_made(), 2);

    let denied = limiter.check_now("a");
    assert_eq!(denied.retry_after(), Some(start + TimeDelta::seconds(40)));
    assert_eq!(denied.retry_after_secs(), Some(30));
    assert_eq!(
        denied.to_json().unwrap(),
        r#"{"error":"Rate limit exceeded","limit":2,"requests_made":3,"retry_after":"2025-02-06T14:30:40Z"}"#
    );

    clock.advance(Duration::from_secs(29));
    assert_eq!(limiter.check_now("a").retry_after_secs(), Some(1));

    clock.advance(Duration::from_secs(1));
    assert_eq!(limiter.check_now("a"), Decision::Allowed { requests_made: 1, limit: 2 });
}

#[test]
fn limiter_trait_object_over_sharded_store() {
    let limiter =
        FixedWindowLimiter::with_store(config(1, Duration::from_secs(60)), ShardedStore::new());
    let as_trait: &dyn RateLimiter<Error = LimiterError<Infallible>> = &limiter;

    assert!(as_trait.check("x").unwrap().is_allowed());
    assert!(!as_trait.check("x").unwrap().is_allowed());
    assert!(as_trait.check("y").unwrap().is_allowed());

    let state = limiter.store().get("x").unwrap().expect("tracked");
    assert_eq!(state.request_count, 2);
    assert!(state.blocked_until.is_some());
}

#[test]
fn clones_share_state() {
    let limiter = FixedWindowLimiter::new(config(1, Duration::from_secs(60)));
    let other = limiter.clone();

    assert!(limiter.check_now("shared").is_allowed());
    assert!(!other.check_now("shared").is_allowed());
}
