use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{event, instrument, Level};

use crate::error::KvError;
use crate::node::messages::{AddPeerRequest, DelPeerResponse};
use crate::node::{KvNode, NodeName};
use crate::peers::PeerInfo;

#[instrument(skip(state), level = "debug")]
pub async fn add_peer(
    Path(area): Path<String>,
    State(state): State<KvNode>,
    Json(request): Json<AddPeerRequest>,
) -> Result<StatusCode, KvError> {
    state
        .add_peer(&area, request.name, &request.addr)
        .await
        .map_err(|err| {
            event!(
                Level::ERROR,
                message = "Failed adding peer",
                err = format!("{:?}", err)
            );
            err
        })?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), level = "debug")]
pub async fn del_peer(
    Path((area, name)): Path<(String, String)>,
    State(state): State<KvNode>,
) -> Result<Json<DelPeerResponse>, KvError> {
    let name = NodeName::from(name);
    let removed = state.del_peer(&area, name.clone()).await.map_err(|err| {
        event!(
            Level::ERROR,
            message = "Failed deleting peer",
            err = format!("{:?}", err)
        );
        err
    })?;
    Ok(Json(DelPeerResponse { name, removed }))
}

#[instrument(skip(state), level = "debug")]
pub async fn get_peers(
    Path(area): Path<String>,
    State(state): State<KvNode>,
) -> Result<Json<Vec<PeerInfo>>, KvError> {
    state
        .get_peers(&area)
        .await
        .map_err(|err| {
            event!(
                Level::ERROR,
                message = "Failed listing peers",
                err = format!("{:?}", err)
            );
            err
        })
        .map(Json)
}
