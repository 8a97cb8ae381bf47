use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/stats
///
/// Returns per-limiter counters and the number of tracked clients.
pub async fn get_stats(State(state): State<SharedState>) -> Json<Value> {
    let limiters = state.snapshots();
    let admitted: u64 = limiters.iter().map(|l| l.admitted).sum();
    let throttled: u64 = limiters.iter().map(|l| l.throttled).sum();

    Json(json!({
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "admitted_requests": admitted,
        "throttled_requests": throttled,
        "limiters": limiters
    }))
}
