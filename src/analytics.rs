//! Per-room toxicity reports built from stored message history.

use std::{cmp::Ordering, collections::BTreeMap, sync::Arc};

use axum::{
    debug_handler,
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::{db::PersistenceStore, moderation::TOXIC_CUTOFF, AppResult, AppState};

const TOP_N: usize = 5;

pub fn router() -> Router<AppState> {
    Router::new().route("/rooms/{room_id}", get(room_analytics))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserToxicity {
    pub username: String,
    pub message_count: u64,
    pub average_toxicity: f64,
    pub toxic_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomAnalytics {
    pub room_id: String,
    pub total_messages: u64,
    pub most_toxic_users: Vec<UserToxicity>,
    pub safest_users: Vec<UserToxicity>,
    pub most_active_users: Vec<UserToxicity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalyticsReport {
    Room(RoomAnalytics),
    Empty { message: &'static str },
}

/// Aggregates `(sender, toxicity)` rows into the room report.
pub fn summarize(room_id: &str, rows: &[(String, f64)]) -> AnalyticsReport {
    if rows.is_empty() {
        return AnalyticsReport::Empty {
            message: "No data available for this room",
        };
    }

    // (count, sum, toxic)
    let mut per_user: BTreeMap<&str, (u64, f64, u64)> = BTreeMap::new();
    for (sender, toxicity) in rows {
        let entry = per_user.entry(sender.as_str()).or_default();
        entry.0 += 1;
        entry.1 += toxicity;
        if *toxicity >= TOXIC_CUTOFF {
            entry.2 += 1;
        }
    }

    let users: Vec<UserToxicity> = per_user
        .into_iter()
        .map(|(username, (count, sum, toxic))| UserToxicity {
            username: username.to_owned(),
            message_count: count,
            average_toxicity: (sum / count as f64 * 10_000.0).round() / 10_000.0,
            toxic_messages: toxic,
        })
        .collect();

    let by_toxicity = |a: &UserToxicity, b: &UserToxicity| {
        a.average_toxicity
            .partial_cmp(&b.average_toxicity)
            .unwrap_or(Ordering::Equal)
    };

    RoomAnalytics {
        room_id: room_id.to_owned(),
        total_messages: rows.len() as u64,
        most_toxic_users: top(&users, |a, b| by_toxicity(b, a)),
        safest_users: top(&users, by_toxicity),
        most_active_users: top(&users, |a, b| b.message_count.cmp(&a.message_count)),
    }
    .into()
}

fn top(users: &[UserToxicity], order: impl Fn(&UserToxicity, &UserToxicity) -> Ordering) -> Vec<UserToxicity> {
    let mut ranked = users.to_vec();
    ranked.sort_by(order);
    ranked.truncate(TOP_N);
    ranked
}

impl From<RoomAnalytics> for AnalyticsReport {
    fn from(report: RoomAnalytics) -> Self {
        AnalyticsReport::Room(report)
    }
}

#[debug_handler(state = AppState)]
async fn room_analytics(
    Path(room_id): Path<String>,
    State(store): State<Arc<dyn PersistenceStore>>,
) -> AppResult<Json<AnalyticsReport>> {
    let rows = store.message_toxicity(&room_id).await?;
    Ok(Json(summarize(&room_id, &rows)))
}
