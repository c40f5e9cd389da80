use crate::capture::{id_from_query, BurstReplay, CaptureId, CapturedRequest, ReplayError};
use crate::state::AppState;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::{header, HeaderValue, StatusCode};
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

pub fn routes(
    state: Arc<AppState>,
    replay: Arc<BurstReplay>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let burst = burst_route(replay);
    let requests = requests_routes(state.clone());
    let ca = ca_route(state.clone());
    let metrics = metrics_route(state);

    burst.or(requests).or(ca).or(metrics)
}

fn burst_route(
    replay: Arc<BurstReplay>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("burst")
        .and(warp::post())
        .and(
            warp::query::raw()
                .or(warp::any().map(String::new))
                .unify(),
        )
        .and(warp::any().map(move || replay.clone()))
        .and_then(burst)
}

fn requests_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let list = warp::path!("api" / "requests")
        .and(warp::get())
        .and(warp::query::<ListQuery>())
        .and(with_state(state.clone()))
        .and_then(list_requests);

    let detail = warp::path!("api" / "requests" / String)
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_request);

    list.or(detail)
}

fn ca_route(state: Arc<AppState>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("ca.pem")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            let mut response = Response::new(state.ca.root_pem().to_string().into());
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-pem-file"),
            );
            response
        })
}

fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            warp::reply::with_header(
                state.metrics.render(),
                "content-type",
                "text/plain; version=0.0.4",
            )
        })
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// `{"message": ...}` with the given status.
pub fn error_reply(status: u16, message: impl Into<String>) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "message": message.into() })),
        status,
    )
    .into_response()
}

async fn burst(query: String, replay: Arc<BurstReplay>) -> Result<Response, Rejection> {
    let id = id_from_query(Some(&query));
    match replay.replay(id.as_deref()).await {
        Ok(outcome) => {
            let mut response = Response::new(outcome.body.into());
            *response.status_mut() =
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::BAD_GATEWAY);
            if let Some(value) = outcome
                .content_type
                .as_deref()
                .and_then(|ct| HeaderValue::from_str(ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
            Ok(response)
        }
        Err(e) => {
            tracing::warn!(id = id.as_deref().unwrap_or_default(), error = %e, "Replay failed");
            Ok(error_reply(e.status().as_u16(), e.to_string()))
        }
    }
}

async fn list_requests(query: ListQuery, state: Arc<AppState>) -> Result<Response, Rejection> {
    let Some(store) = &state.store else {
        return Ok(error_reply(503, ReplayError::Disabled.to_string()));
    };

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    match store.list(limit).await {
        Ok(summaries) => Ok(warp::reply::json(&serde_json::json!({
            "requests": summaries,
        }))
        .into_response()),
        Err(e) => Ok(error_reply(500, e.to_string())),
    }
}

async fn get_request(raw_id: String, state: Arc<AppState>) -> Result<Response, Rejection> {
    let Some(store) = &state.store else {
        return Ok(error_reply(503, ReplayError::Disabled.to_string()));
    };

    let id: CaptureId = match raw_id.parse() {
        Ok(id) => id,
        Err(e) => return Ok(error_reply(400, ReplayError::InvalidId(e).to_string())),
    };

    match store.load(&id).await {
        Ok(Some(record)) => Ok(warp::reply::json(&detail(&record)).into_response()),
        Ok(None) => Ok(error_reply(404, ReplayError::NotFound(id).to_string())),
        Err(e) => Ok(error_reply(500, e.to_string())),
    }
}

fn detail(record: &CapturedRequest) -> serde_json::Value {
    let request = &record.request;
    serde_json::json!({
        "id": record.id,
        "method": request.method,
        "url": request.url,
        "version": request.version,
        "host": request.host,
        "remote_addr": request.remote_addr,
        "headers": request.headers,
        "body": String::from_utf8_lossy(&request.body),
        "body_size": request.body.len(),
        "created_at": request.created_at,
    })
}
