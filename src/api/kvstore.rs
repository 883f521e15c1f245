use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{event, instrument, Level};

use crate::error::KvError;
use crate::kvstore::filter::KvFilter;
use crate::kvstore::record::Publication;
use crate::node::messages::{
    AreaSummary, MergeSummary, SetKeyValsRequest, SetLocalKeyRequest, SubscribeRequest,
    UnsetLocalKeyResponse,
};
use crate::node::KvNode;

/// Comma-separated list in a query string
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub keys: Option<String>,
    #[serde(default)]
    pub areas: Option<String>,
}

fn split_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn log_failure(message: &str, err: &KvError) {
    event!(Level::ERROR, message = message, err = format!("{:?}", err));
}

#[instrument(skip(state), level = "debug")]
pub async fn get_key_vals(
    Path(area): Path<String>,
    Query(query): Query<ListQuery>,
    State(state): State<KvNode>,
) -> Result<Json<Publication>, KvError> {
    state
        .get_key_vals(&area, split_list(&query.keys))
        .await
        .inspect_err(|err| log_failure("Failed reading keys", err))
        .map(Json)
}

#[instrument(skip(state), level = "debug")]
pub async fn get_key_vals_filtered(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(filter): Json<KvFilter>,
) -> Result<Json<Publication>, KvError> {
    state
        .get_key_vals_filtered(&area, &filter)
        .await
        .inspect_err(|err| log_failure("Failed dumping keys", err))
        .map(Json)
}

#[instrument(skip(state), level = "debug")]
pub async fn get_hashes_filtered(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(filter): Json<KvFilter>,
) -> Result<Json<Publication>, KvError> {
    state
        .get_hashes_filtered(&area, &filter)
        .await
        .inspect_err(|err| log_failure("Failed dumping hashes", err))
        .map(Json)
}

#[instrument(skip(state, request), level = "debug")]
pub async fn set_key_vals(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(request): Json<SetKeyValsRequest>,
) -> Result<Json<MergeSummary>, KvError> {
    state
        .set_key_vals(&area, request.key_vals)
        .await
        .inspect_err(|err| log_failure("Failed setting key vals", err))
        .map(Json)
}

#[instrument(skip(state, request), level = "debug")]
pub async fn set_local_key(
    Path((area, key)): Path<(String, String)>,
    State(state): State<KvNode>,
    Json(request): Json<SetLocalKeyRequest>,
) -> Result<StatusCode, KvError> {
    state
        .set_local_key(&area, &key, request.value.into_bytes())
        .await
        .inspect_err(|err| log_failure("Failed setting local key", err))?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), level = "debug")]
pub async fn unset_local_key(
    Path((area, key)): Path<(String, String)>,
    State(state): State<KvNode>,
) -> Result<Json<UnsetLocalKeyResponse>, KvError> {
    let was_local = state
        .unset_local_key(&area, &key)
        .await
        .inspect_err(|err| log_failure("Failed unsetting local key", err))?;
    Ok(Json(UnsetLocalKeyResponse { key, was_local }))
}

#[instrument(skip(state), level = "debug")]
pub async fn get_area_summary(
    Query(query): Query<ListQuery>,
    State(state): State<KvNode>,
) -> Result<Json<Vec<AreaSummary>>, KvError> {
    state
        .get_area_summary(&split_list(&query.areas))
        .await
        .inspect_err(|err| log_failure("Failed building area summary", err))
        .map(Json)
}

fn publication_event(kind: &str, publication: &Publication) -> Event {
    Event::default()
        .event(kind)
        .json_data(publication)
        .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()))
}

/// Snapshot events (one per area) followed by live publications. A
/// backpressure error is sent as an `error` event and ends the stream.
#[instrument(skip(state), level = "debug")]
pub async fn subscribe(
    State(state): State<KvNode>,
    Json(request): Json<SubscribeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, KvError> {
    let (snapshots, updates) = state
        .subscribe(&request.filter, &request.areas)
        .await
        .inspect_err(|err| log_failure("Failed subscribing", err))?;

    let initial = stream::iter(
        snapshots
            .into_iter()
            .map(|snapshot| publication_event("snapshot", &snapshot)),
    );
    let updates = updates.map(|item| match item {
        Ok(publication) => publication_event("publication", &publication),
        Err(err) => {
            log_failure("Subscriber stream failed", &err);
            Event::default().event("error").data(err.to_string())
        }
    });
    Ok(Sse::new(initial.chain(updates).map(Ok)).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_list() {
        assert_eq!(
            split_list(&Some("a, b,,c".to_string())),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(split_list(&None).is_empty());
    }
}
