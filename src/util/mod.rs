pub mod fp;

/// Wall-clock milliseconds since the Unix epoch.
///
/// The feed reports `last_update_ts` on this clock, so freshness checks have
/// to use it too (monotonic time would disagree with the feed's stamps).
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
