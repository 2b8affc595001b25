use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::{collections::HashMap, net::IpAddr, num::NonZeroU32, sync::Arc, time::Duration};
use tokio::sync::RwLock;

/// Blanket per-IP request quota for the whole API surface.
///
/// This is deliberately separate from the per-model token buckets in
/// `services::rate_limit_service`: the buckets protect each upstream model,
/// this limiter protects the gateway itself from a single noisy client.
///
/// Each unique IP address gets its own governor cell. Idle entries are
/// evicted by a periodic cleanup task.
#[derive(Clone)]
pub struct PerIpRateLimiter {
    buckets: Arc<RwLock<HashMap<IpAddr, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>>>,
    quota: Quota,
    cleanup_after: Duration,
}

impl PerIpRateLimiter {
    /// * `requests_per_minute` – how many requests a single IP may issue per minute.
    /// * `cleanup_after` – how long an idle bucket is kept before it can be evicted.
    pub fn new(requests_per_minute: u32, cleanup_after: Duration) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        );
        Self {
            buckets: Arc::new(RwLock::new(HashMap::new())),
            quota,
            cleanup_after,
        }
    }

    /// Check whether the given IP address is within its rate limit.
    pub async fn check(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        // Fast path: read lock to check an existing bucket.
        {
            let buckets = self.buckets.read().await;
            if let Some(limiter) = buckets.get(&ip) {
                return match limiter.check() {
                    Ok(_) => Ok(()),
                    Err(_) => Err(RateLimitError),
                };
            }
        }

        // Slow path: need to insert a new bucket.
        let mut buckets = self.buckets.write().await;

        // Double-check after acquiring write lock.
        let limiter = buckets
            .entry(ip)
            .or_insert_with(|| Arc::new(RateLimiter::direct(self.quota)));

        match limiter.check() {
            Ok(_) => Ok(()),
            Err(_) => Err(RateLimitError),
        }
    }

    /// Remove buckets whose tokens have fully replenished; a full bucket
    /// means the IP has been idle long enough to forget about.
    pub async fn cleanup(&self) {
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_ip, limiter| limiter.check().is_err());
        let removed = before - buckets.len();
        if removed > 0 {
            tracing::debug!(
                "Rate limiter cleanup: removed {} idle buckets, {} remaining",
                removed,
                buckets.len()
            );
        }
    }

    /// Spawn a background task that periodically cleans up idle buckets.
    pub fn spawn_cleanup_task(self) -> tokio::task::JoinHandle<()> {
        let interval = self.cleanup_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.cleanup().await;
            }
        })
    }
}

/// Rate limit exceeded error — returns 429 Too Many Requests.
pub struct RateLimitError;

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", "60"), ("x-ratelimit-exceeded", "true")],
            "Rate limit exceeded. Please try again later.",
        )
            .into_response()
    }
}

/// Extract the client IP address from the request.
///
/// Checks (in order):
/// 1. `X-Forwarded-For` header (first entry, set by reverse proxies)
/// 2. `X-Real-Ip` header
/// 3. The connected peer address from the connection info
/// 4. Falls back to 127.0.0.1
///
/// Forwarding headers are honored here (unlike loopback detection in the
/// auth middleware) because the quota should track the originating client
/// even behind a proxy; spoofing them only buys an attacker a stricter
/// shared bucket.
fn extract_client_ip(request: &Request) -> IpAddr {
    if let Some(xff) = request.headers().get("x-forwarded-for") {
        if let Ok(xff_str) = xff.to_str() {
            if let Some(first_ip) = xff_str.split(',').next() {
                if let Ok(ip) = first_ip.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    if let Some(xri) = request.headers().get("x-real-ip") {
        if let Ok(xri_str) = xri.to_str() {
            if let Ok(ip) = xri_str.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    if let Some(connect_info) = request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
    {
        return connect_info.0.ip();
    }

    IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
}

/// Per-IP rate-limiting middleware for use with `axum::middleware::from_fn`.
pub async fn per_ip_rate_limit(
    limiter: PerIpRateLimiter,
    request: Request,
    next: Next,
) -> Response {
    let ip = extract_client_ip(&request);

    match limiter.check(ip).await {
        Ok(()) => next.run(request).await,
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_within_quota_passes() {
        let limiter = PerIpRateLimiter::new(60, Duration::from_secs(600));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..10 {
            assert!(limiter.check(ip).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_quota_exhaustion_rejects() {
        // Quota of 1/min with no burst headroom: second call must fail.
        let limiter = PerIpRateLimiter::new(1, Duration::from_secs(600));
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(ip).await.is_ok());
        assert!(limiter.check(ip).await.is_err());
    }

    #[tokio::test]
    async fn test_ips_get_independent_buckets() {
        let limiter = PerIpRateLimiter::new(1, Duration::from_secs(600));
        assert!(limiter.check("10.0.0.3".parse().unwrap()).await.is_ok());
        assert!(limiter.check("10.0.0.4".parse().unwrap()).await.is_ok());
    }
}
