//! Discovery cache state and HTTP caching header helpers.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;

use crate::models::Endpoint;

/// How long a successful response stays fresh without a `max-age`.
pub const DEFAULT_SUCCESS_TTL: Duration = Duration::from_secs(30);
/// How long to wait after a failed call before trying again.
pub const FAILURE_TTL: Duration = Duration::from_secs(5);
/// Upper bound on any server-supplied `max-age`.
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Last known server list for one fleet and discovery URI.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryCache {
    pub etag: Option<String>,
    pub servers: Vec<Endpoint>,
    pub expires_at: Option<DateTime<Utc>>,
    /// The most recent call failed; `expires_at` is the retry time.
    pub failed: bool,
}

impl DiscoveryCache {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if now <= expires)
    }

    pub fn refresh(&mut self, now: DateTime<Utc>, max_age: Option<Duration>) {
        let ttl = max_age.unwrap_or(DEFAULT_SUCCESS_TTL);
        self.expires_at = Some(now + to_chrono(ttl));
        self.failed = false;
    }

    /// Replace the server list, keeping back-off stamps of servers that are
    /// still present.
    pub fn replace_servers(&mut self, mut servers: Vec<Endpoint>) {
        for server in &mut servers {
            if let Some(previous) = self.servers.iter().find(|s| s.id() == server.id()) {
                server.backoff_until = previous.backoff_until;
            }
        }
        self.servers = servers;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.expires_at = Some(now + to_chrono(FAILURE_TTL));
        self.failed = true;
    }

    pub fn set_backoff(&mut self, endpoint_id: u64, until: DateTime<Utc>) {
        for server in self.servers.iter_mut().filter(|s| s.id() == endpoint_id) {
            server.backoff_until = Some(until);
        }
    }
}

/// Extract `max-age` from a `Cache-Control` header value.
pub fn parse_max_age(cache_control: &str) -> Option<Duration> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"(?i)(?:^|[,\s])max-age\s*=\s*"?(?P<secs>\d+)"?"#).unwrap());

    let caps = re.captures(cache_control)?;
    let secs = caps.name("secs")?.as_str().parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d.min(MAX_TTL)).unwrap_or_else(|_| ChronoDuration::seconds(0))
}
