use actix_web::http::header::USER_AGENT;
use actix_web::{get, post, put, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use super::limits::client_key;
use crate::error::AppError;
use crate::proto::video::{ConnectionEvent, UpdateClientRequest};
use crate::services::client_info::{DEFAULT_LIMIT, DEFAULT_PAGE};
use crate::state::AppState;

/// Paging parameters; unparsable values fall back to the defaults.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    page: Option<String>,
    limit: Option<String>,
}

impl ListQuery {
    fn page(&self) -> i32 {
        parse_or(self.page.as_deref(), DEFAULT_PAGE)
    }

    fn limit(&self) -> i32 {
        parse_or(self.limit.as_deref(), DEFAULT_LIMIT)
    }
}

fn parse_or(raw: Option<&str>, default: i32) -> i32 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

#[post("/connected")]
pub async fn client_connected(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ConnectionEvent>,
) -> Result<HttpResponse, AppError> {
    let mut event = body.into_inner();
    if event.ip_address.is_empty() {
        event.ip_address = client_key(&req);
    }
    if event.user_agent.is_empty() {
        if let Some(ua) = req.headers().get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            event.user_agent = ua.to_string();
        }
    }

    let resp = state.clients.client_connected(event).await?;
    Ok(HttpResponse::Ok().json(resp))
}

#[post("/disconnected")]
pub async fn client_disconnected(
    state: web::Data<AppState>,
    body: web::Json<ConnectionEvent>,
) -> Result<HttpResponse, AppError> {
    let resp = state.clients.client_disconnected(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(resp))
}

#[get("/active")]
pub async fn list_active_clients(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> HttpResponse {
    let resp = state
        .clients
        .list_active_clients(query.page(), query.limit())
        .await;

    HttpResponse::Ok().json(json!({
        "status": "ok",
        "data": resp.clients,
        "meta": {
            "total": resp.total,
            "page": resp.page,
            "limit": resp.limit,
        },
    }))
}

#[put("/{client_id}")]
pub async fn update_client(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<UpdateClientRequest>,
) -> Result<HttpResponse, AppError> {
    let client_id = path.into_inner();
    let resp = state
        .clients
        .update_client_info(&client_id, body.into_inner().client_info)
        .await?;
    Ok(HttpResponse::Ok().json(resp))
}

#[get("/{client_id}")]
pub async fn get_client(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let client = state.clients.get_client_info(&path.into_inner()).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "data": client,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_falls_back_on_garbage() {
        let query = ListQuery {
            page: Some("abc".to_string()),
            limit: Some(" 5 ".to_string()),
        };
        assert_eq!(query.page(), DEFAULT_PAGE);
        assert_eq!(query.limit(), 5);
    }
}
