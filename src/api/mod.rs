mod base;
mod flood;
mod kvstore;
mod peers;

use std::borrow::Cow;

use axum::{
    error_handling::HandleErrorLayer, http::StatusCode, response::IntoResponse, routing, Router,
};
use tokio::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::trace::TraceLayer;

pub mod paths;

pub use base::AboutResponse;
pub use kvstore::ListQuery;

use crate::error::Result;
use crate::node::KvNode;

/// Build the HTTP API in front of a running node
pub async fn api(node: KvNode) -> Result<Router> {
    let api = Router::new()
        .route(paths::base::ROOT, routing::get(base::root))
        .route(paths::base::HEALTH, routing::get(base::health))
        .route(paths::base::ABOUT, routing::get(base::about))
        // Store reads and writes
        .route(
            paths::kvstore::KEYS,
            routing::get(kvstore::get_key_vals).post(kvstore::set_key_vals),
        )
        .route(paths::kvstore::KEYS_FILTERED, routing::post(kvstore::get_key_vals_filtered))
        .route(paths::kvstore::HASHES_FILTERED, routing::post(kvstore::get_hashes_filtered))
        .route(
            paths::kvstore::LOCAL_KEY,
            routing::put(kvstore::set_local_key).delete(kvstore::unset_local_key),
        )
        .route(paths::kvstore::SUMMARY, routing::get(kvstore::get_area_summary))
        // Peers
        .route(
            paths::peers::PEERS,
            routing::get(peers::get_peers).post(peers::add_peer),
        )
        .route(paths::peers::PEER, routing::delete(peers::del_peer))
        // Spanning tree
        .route(paths::flood::DUAL, routing::post(flood::process_flood_message))
        .route(paths::flood::ROOT_CHILD, routing::post(flood::set_flood_root_child))
        .route(paths::flood::SPANNING_TREE, routing::get(flood::get_spanning_tree_info))
        .layer(
            ServiceBuilder::new()
                // Handle errors from middleware
                .layer(HandleErrorLayer::new(handle_error))
                .load_shed()
                .timeout(Duration::from_secs(10)),
        )
        // Streams outlive the request timeout, so the subscription route sits
        // outside the timeout layer
        .route(paths::kvstore::SUBSCRIBE, routing::post(kvstore::subscribe))
        .layer(TraceLayer::new_for_http())
        .with_state(node);

    Ok(api)
}

async fn handle_error(error: BoxError) -> impl IntoResponse {
    if error.is::<tower::timeout::error::Elapsed>() {
        return (StatusCode::REQUEST_TIMEOUT, Cow::from("request timed out"));
    }

    if error.is::<tower::load_shed::error::Overloaded>() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Cow::from("service is overloaded, try again later"),
        );
    }

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Cow::from(format!("Unhandled internal error: {}", error)),
    )
}
