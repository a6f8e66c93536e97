//! Traffic defense chain for the redirect route.
//!
//! Guards are heuristics, not authorization: a guard that cannot reach its
//! store lets the request through and logs why.

pub mod anomaly;
pub mod throttle;

use async_trait::async_trait;
use axum::http::StatusCode;
use std::sync::Arc;
use tracing::{info, warn};

use crate::store::StoreError;

pub use anomaly::TrafficAnomalyGuard;
pub use throttle::Throttle;

/// What a guard gets to look at.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: String,
    pub short_code: String,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny {
        status: StatusCode,
        reason: &'static str,
    },
}

#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err` means the guard could not decide; the chain treats it as allow.
    async fn check(&self, ctx: &RequestContext) -> Result<Verdict, StoreError>;
}

/// Guards run in insertion order; the first deny wins.
#[derive(Clone, Default)]
pub struct GuardChain {
    guards: Vec<Arc<dyn Guard>>,
}

impl GuardChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, guard: impl Guard + 'static) -> Self {
        self.guards.push(Arc::new(guard));
        self
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub async fn check(&self, ctx: &RequestContext) -> Verdict {
        for guard in &self.guards {
            match guard.check(ctx).await {
                Ok(Verdict::Allow) => {}
                Ok(deny) => {
                    info!(
                        "{} denied {} on '{}': {:?}",
                        guard.name(),
                        ctx.ip,
                        ctx.short_code,
                        deny
                    );
                    return deny;
                }
                Err(e) => {
                    warn!(
                        "{} failed open for {} on '{}': {}",
                        guard.name(),
                        ctx.ip,
                        ctx.short_code,
                        e
                    );
                }
            }
        }
        Verdict::Allow
    }
}
