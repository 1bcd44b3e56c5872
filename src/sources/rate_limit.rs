//! Per-host request pacing.
//!
//! Every call to a given external host passes through the same pacer no
//! matter which request initiated it. The pacer is deliberately not a
//! token bucket: there is no burst allowance, each request sleeps until
//! its reserved slot, so a 3 req/s limit is an even 333 ms spacing.
//!
//! Slot bookkeeping is a short synchronous critical section; the sleep
//! itself happens outside the lock.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::time::Instant;

struct HostSlot {
    next_at: Instant,
    min_interval: Duration,
}

fn slots() -> &'static Mutex<HashMap<String, HostSlot>> {
    static SLOTS: OnceLock<Mutex<HashMap<String, HostSlot>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

const DEFAULT_INTERVAL: Duration = Duration::from_millis(334);

/// Configures the pacing interval for a host from its requests-per-second
/// limit. Called per source at pipeline startup.
pub fn set_rate(host: &str, requests_per_second: f64) {
    let min_interval = if requests_per_second > 0.0 {
        Duration::from_secs_f64(1.0 / requests_per_second)
    } else {
        DEFAULT_INTERVAL
    };
    let Ok(mut slots) = slots().lock() else { return };
    slots
        .entry(host.to_string())
        .and_modify(|slot| slot.min_interval = min_interval)
        .or_insert(HostSlot {
            next_at: Instant::now(),
            min_interval,
        });
}

/// Extracts the pacing key (the host) from a URL.
pub fn host_of(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}

/// Reserves the next permitted slot for `host` and sleeps until it.
pub async fn wait_for_host(host: &str) {
    let reserved = {
        let Ok(mut slots) = slots().lock() else { return };
        let now = Instant::now();
        let slot = slots.entry(host.to_string()).or_insert(HostSlot {
            next_at: now,
            min_interval: DEFAULT_INTERVAL,
        });
        let at = if slot.next_at > now { slot.next_at } else { now };
        slot.next_at = at + slot.min_interval;
        at
    };
    tokio::time::sleep_until(reserved).await;
}

/// Convenience for callers holding a full URL.
pub async fn wait_for_url_str(url: &str) {
    wait_for_host(&host_of(url)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consecutive_calls_are_evenly_spaced() {
        set_rate("paced.example", 50.0); // 20 ms spacing
        let start = Instant::now();
        for _ in 0..3 {
            wait_for_host("paced.example").await;
        }
        // First call is immediate, the next two wait a slot each.
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn hosts_do_not_share_slots() {
        set_rate("a.example", 1.0);
        set_rate("b.example", 1000.0);
        wait_for_host("a.example").await;
        let start = Instant::now();
        wait_for_host("b.example").await;
        // b's slot is unaffected by a's 1 req/s reservation.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn host_extraction_handles_paths_and_bare_hosts() {
        assert_eq!(host_of("https://api.example.org/v1/x?y=1"), "api.example.org");
        assert_eq!(host_of("api.example.org"), "api.example.org");
    }
}
