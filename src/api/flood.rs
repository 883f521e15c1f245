use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{event, instrument, Level};

use crate::error::KvError;
use crate::flood::dual::{DualMessages, FloodTopoSetParams};
use crate::flood::spt::SptInfos;
use crate::node::KvNode;

#[instrument(skip(state), level = "debug")]
pub async fn process_flood_message(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(messages): Json<DualMessages>,
) -> Result<StatusCode, KvError> {
    state
        .process_flood_message(&area, messages)
        .await
        .map_err(|err| {
            event!(
                Level::ERROR,
                message = "Failed processing dual messages",
                err = format!("{:?}", err)
            );
            err
        })?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), level = "debug")]
pub async fn set_flood_root_child(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(params): Json<FloodTopoSetParams>,
) -> Result<StatusCode, KvError> {
    state.set_flood_root_child(&area, params).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), level = "debug")]
pub async fn get_spanning_tree_info(
    Path(area): Path<String>,
    State(state): State<KvNode>,
) -> Result<Json<SptInfos>, KvError> {
    state.get_spanning_tree_info(&area).await.map(Json)
}
