use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::jobs::JobStatus;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    store: &'static str,
    jobs: Vec<JobStatus>,
}

/// GET /health
///
/// Always 200 while the process is serving; the body reports which
/// ephemeral store is in use and the state of the background jobs.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let mut jobs = Vec::with_capacity(state.jobs.len());
    for job in &state.jobs {
        jobs.push(job.status().await);
    }

    Json(Health {
        status: "ok",
        store: state.store_kind,
        jobs,
    })
}

#[cfg(test)]
mod tests {
    use crate::{config::AppConfig, db, router, store::MemoryStore, AppState};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn reports_job_status() {
        let pool = db::test_pool().await;
        let state = Arc::new(AppState::build(
            AppConfig::default(),
            pool,
            Arc::new(MemoryStore::new()),
        ));
        state.jobs[1].run_once().await.unwrap();

        let resp = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["store"], "memory");
        assert_eq!(json["jobs"][0]["name"], "stats-flush");
        assert_eq!(json["jobs"][0]["runs"], 0);
        assert_eq!(json["jobs"][1]["name"], "expiry-sweep");
        assert_eq!(json["jobs"][1]["runs"], 1);
        assert_eq!(json["jobs"][1]["running"], false);
    }
}
