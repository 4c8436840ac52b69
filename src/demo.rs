//! Demo application served behind the gate by the `edgegate` binary.
//!
//! `POST /reviews` is the usual rate limited route and `POST /organizations`
//! the usual idempotent one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header::LOCATION;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::http::Gate;

/// Request body for `POST /organizations`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOrganization {
    pub name: String,
}

/// An organization as returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /reviews`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateReview {
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
}

/// A submitted review.
#[derive(Debug, Clone, Serialize)]
pub struct Review {
    pub id: u64,
    pub rating: u8,
    pub comment: Option<String>,
}

/// In-memory backing state for the demo routes.
#[derive(Debug, Clone, Default)]
pub struct DemoState {
    organizations: Arc<RwLock<HashMap<u64, Organization>>>,
    next_org_id: Arc<AtomicU64>,
    reviews: Arc<AtomicU64>,
}

impl DemoState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of organizations created so far.
    pub fn organization_count(&self) -> usize {
        self.organizations.read().len()
    }

    /// Number of reviews submitted so far.
    pub fn review_count(&self) -> u64 {
        self.reviews.load(Ordering::SeqCst)
    }
}

/// Build the demo router with `gate` in front of every route.
pub fn router(gate: &Gate, state: DemoState) -> Router {
    let routes = Router::new()
        .route("/reviews", post(create_review))
        .route("/organizations", post(create_organization))
        .route("/organizations/{id}", get(get_organization));
    gate.layer(routes).with_state(state)
}

async fn create_review(
    State(state): State<DemoState>,
    Json(body): Json<CreateReview>,
) -> Response {
    if !(1..=5).contains(&body.rating) {
        return (StatusCode::UNPROCESSABLE_ENTITY, "rating must be between 1 and 5").into_response();
    }
    let id = state.reviews.fetch_add(1, Ordering::SeqCst) + 1;
    let review = Review {
        id,
        rating: body.rating,
        comment: body.comment,
    };
    (StatusCode::CREATED, Json(review)).into_response()
}

async fn create_organization(
    State(state): State<DemoState>,
    Json(body): Json<CreateOrganization>,
) -> Response {
    let id = state.next_org_id.fetch_add(1, Ordering::SeqCst) + 1;
    let organization = Organization {
        id,
        name: body.name,
        created_at: Utc::now(),
    };
    state
        .organizations
        .write()
        .insert(id, organization.clone());
    info!(id = id, name = %organization.name, "Organization created");

    let mut response = (StatusCode::CREATED, Json(organization)).into_response();
    if let Ok(location) = HeaderValue::from_str(&format!("/organizations/{}", id)) {
        response.headers_mut().insert(LOCATION, location);
    }
    response
}

async fn get_organization(State(state): State<DemoState>, Path(id): Path<u64>) -> Response {
    match state.organizations.read().get(&id) {
        Some(organization) => Json(organization.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
