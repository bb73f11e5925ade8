use axum::{
    extract::{Json, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
    Router,
};
use common::api::{
    AttachServiceRequest, ErrorResponse, PortRequest, ProfileServiceResponse, ReplaceProfileRequest,
    ReplaceProfileResponse, StatusRequest, ValidationResponse,
};
use common::wire::UpdateServiceRequest;
use common::{Instance, Profile, ProxyRecord, ProxyStatus, Service, Snapshot, Toast, SNAPSHOT_FILE};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::{DashboardError, StoreError};
use crate::snapshot;
use crate::state::AppState;
use crate::store::Collection;

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = match &self {
            DashboardError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            DashboardError::Store(StoreError::Invalid(errors)) => {
                let body = ValidationResponse { errors: errors.clone() };
                return (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response();
            }
            DashboardError::Store(_) | DashboardError::Snapshot(_) => StatusCode::BAD_REQUEST,
            DashboardError::Remote(_) => StatusCode::BAD_GATEWAY,
            DashboardError::Database(_) | DashboardError::Io(_) => {
                error!("Internal error: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse { error: self.to_string() };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, DashboardError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/services", get(list_entities::<Service>).post(create_entity::<Service>))
        .route(
            "/services/{id}",
            get(get_entity::<Service>)
                .patch(update_entity::<Service>)
                .delete(delete_service),
        )
        .route("/profiles", get(list_entities::<Profile>).post(create_entity::<Profile>))
        .route(
            "/profiles/{id}",
            get(get_entity::<Profile>)
                .patch(update_entity::<Profile>)
                .delete(delete_profile),
        )
        .route(
            "/profiles/{id}/services/{service_id}",
            post(add_profile_service).delete(remove_profile_service),
        )
        .route("/instances", get(list_entities::<Instance>).post(create_entity::<Instance>))
        .route(
            "/instances/{id}",
            get(get_entity::<Instance>)
                .patch(update_entity::<Instance>)
                .delete(delete_instance),
        )
        .route("/instances/{id}/proxies", get(list_proxies).post(attach_service))
        .route("/instances/{id}/proxies/{proxy_id}", delete(detach_proxy))
        .route("/instances/{id}/proxies/{proxy_id}/port", post(change_port))
        .route("/instances/{id}/proxies/{proxy_id}/status", post(change_status))
        .route("/instances/{id}/proxies/{proxy_id}/service", patch(update_proxy_service))
        .route("/instances/{id}/profile", put(replace_profile))
        .route("/state", get(download_state).post(import_state))
        .route("/toast", get(current_toast).delete(dismiss_toast))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn list_entities<T: Collection>(State(state): State<AppState>) -> Json<Vec<T>> {
    Json(state.list::<T>().await)
}

async fn get_entity<T: Collection>(
    State(state): State<AppState>,
    Path(id): Path<T::Id>,
) -> ApiResult<Json<T>> {
    Ok(Json(state.find::<T>(&id).await?))
}

async fn create_entity<T: Collection>(
    State(state): State<AppState>,
    Json(draft): Json<T>,
) -> ApiResult<(StatusCode, Json<T>)> {
    let created = state.create(draft).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_entity<T: Collection>(
    State(state): State<AppState>,
    Path(id): Path<T::Id>,
    Json(patch): Json<Value>,
) -> ApiResult<Json<T>> {
    Ok(Json(state.update::<T>(&id, &patch).await?))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Service>> {
    Ok(Json(state.delete_service(&id).await?))
}

async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Profile>> {
    Ok(Json(state.delete_profile(&id).await?))
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.delete_instance(id).await?))
}

async fn add_profile_service(
    State(state): State<AppState>,
    Path((id, service_id)): Path<(String, String)>,
) -> ApiResult<Json<ProfileServiceResponse>> {
    let (profile, changed) = state.add_profile_service(&id, &service_id).await?;
    Ok(Json(ProfileServiceResponse { profile, changed }))
}

async fn remove_profile_service(
    State(state): State<AppState>,
    Path((id, service_id)): Path<(String, String)>,
) -> ApiResult<Json<ProfileServiceResponse>> {
    let (profile, changed) = state.remove_profile_service(&id, &service_id).await?;
    Ok(Json(ProfileServiceResponse { profile, changed }))
}

async fn list_proxies(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<Vec<ProxyRecord>>> {
    Ok(Json(state.refresh_proxies(id).await?))
}

async fn attach_service(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(payload): Json<AttachServiceRequest>,
) -> ApiResult<(StatusCode, Json<ProxyRecord>)> {
    let proxy = state.attach_service(id, &payload.service_id).await?;
    Ok((StatusCode::CREATED, Json(proxy)))
}

async fn detach_proxy(
    State(state): State<AppState>,
    Path((id, proxy_id)): Path<(u64, String)>,
) -> ApiResult<StatusCode> {
    state.detach_proxy(id, &proxy_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn change_port(
    State(state): State<AppState>,
    Path((id, proxy_id)): Path<(u64, String)>,
    Json(payload): Json<PortRequest>,
) -> ApiResult<Json<ProxyRecord>> {
    Ok(Json(state.change_proxy_port(id, &proxy_id, payload.port).await?))
}

async fn change_status(
    State(state): State<AppState>,
    Path((id, proxy_id)): Path<(u64, String)>,
    Json(payload): Json<StatusRequest>,
) -> ApiResult<Json<StatusRequest>> {
    let status: ProxyStatus = state.change_proxy_status(id, &proxy_id, payload.status).await?;
    Ok(Json(StatusRequest { status }))
}

async fn update_proxy_service(
    State(state): State<AppState>,
    Path((id, proxy_id)): Path<(u64, String)>,
    Json(payload): Json<UpdateServiceRequest>,
) -> ApiResult<Json<ProxyRecord>> {
    Ok(Json(state.update_proxy_service(id, &proxy_id, &payload).await?))
}

async fn replace_profile(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(payload): Json<ReplaceProfileRequest>,
) -> ApiResult<Json<ReplaceProfileResponse>> {
    let replacement = state.replace_profile(id, &payload.profile_id).await?;
    Ok(Json(ReplaceProfileResponse {
        instance: replacement.instance,
        attached: replacement.attached,
        retained: replacement.retained,
    }))
}

async fn download_state(State(state): State<AppState>) -> ApiResult<Response> {
    let exported = state.export_state().await?;
    let (content_type, body) = snapshot::download(&exported)?;
    let disposition = format!("attachment; filename=\"{}\"", SNAPSHOT_FILE);
    Ok((
        [(header::CONTENT_TYPE, content_type), (header::CONTENT_DISPOSITION, disposition)],
        body,
    )
        .into_response())
}

async fn import_state(State(state): State<AppState>, body: String) -> ApiResult<Json<Snapshot>> {
    Ok(Json(state.import_state(&body).await?))
}

async fn current_toast(State(state): State<AppState>) -> Json<Toast> {
    Json(state.toast().await)
}

async fn dismiss_toast(State(state): State<AppState>) -> StatusCode {
    state.dismiss_toast().await;
    StatusCode::NO_CONTENT
}
