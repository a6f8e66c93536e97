use async_trait::async_trait;
use axum::http::StatusCode;
use std::time::Duration;

use super::{Guard, RequestContext, Verdict};
use crate::store::{keys, SharedStore, StoreError};

/// Window of the `abuse:` counters.
pub const ABUSE_WINDOW: Duration = Duration::from_secs(600);

pub const GLOBAL_IP_LIMIT: i64 = 100;
pub const LINK_IP_LIMIT: i64 = 60;

#[derive(Debug, Clone)]
enum Scope {
    /// `abuse:<ip>`
    GlobalIp,
    /// `abuse:<code>:<ip>`
    LinkIp,
    /// `<prefix>:<ip>`
    Prefixed(String),
}

/// Fixed-window counter guard. The window starts with the first request and
/// resets when the key expires; a request is denied once the count in the
/// current window exceeds `limit`.
pub struct Throttle {
    name: &'static str,
    store: SharedStore,
    scope: Scope,
    limit: i64,
    window: Duration,
    status: StatusCode,
    reason: &'static str,
}

impl Throttle {
    /// Per-IP ceiling across every link, answered with 403.
    pub fn global_ip(store: SharedStore, limit: i64) -> Self {
        Self {
            name: "global-ip-throttle",
            store,
            scope: Scope::GlobalIp,
            limit,
            window: ABUSE_WINDOW,
            status: StatusCode::FORBIDDEN,
            reason: "Too many requests from this address",
        }
    }

    /// Per-IP ceiling on a single link, answered with 403.
    pub fn link_ip(store: SharedStore, limit: i64) -> Self {
        Self {
            name: "link-ip-throttle",
            store,
            scope: Scope::LinkIp,
            limit,
            window: ABUSE_WINDOW,
            status: StatusCode::FORBIDDEN,
            reason: "Too many requests for this link",
        }
    }

    /// Generic limiter keyed `<prefix>:<ip>`, answered with 429.
    pub fn fixed_window(
        store: SharedStore,
        prefix: impl Into<String>,
        limit: i64,
        window: Duration,
    ) -> Self {
        Self {
            name: "rate-limiter",
            store,
            scope: Scope::Prefixed(prefix.into()),
            limit,
            window,
            status: StatusCode::TOO_MANY_REQUESTS,
            reason: "Rate limit exceeded",
        }
    }

    fn key(&self, ctx: &RequestContext) -> String {
        match &self.scope {
            Scope::GlobalIp => keys::abuse_ip(&ctx.ip),
            Scope::LinkIp => keys::abuse_link_ip(&ctx.short_code, &ctx.ip),
            Scope::Prefixed(prefix) => keys::limiter(prefix, &ctx.ip),
        }
    }
}

#[async_trait]
impl Guard for Throttle {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn check(&self, ctx: &RequestContext) -> Result<Verdict, StoreError> {
        let count = self.store.incr_window(&self.key(ctx), self.window).await?;
        if count > self.limit {
            return Ok(Verdict::Deny {
                status: self.status,
                reason: self.reason,
            });
        }
        Ok(Verdict::Allow)
    }
}
