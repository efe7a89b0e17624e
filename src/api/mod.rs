use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use chrono::Local;
use log::{error, info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use serde::Serialize;
use std::sync::{Arc, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::Sender;
use utoipa::ToSchema;

use crate::config::{config_snapshot, HttpdConfig, CONFIG};
use crate::models::Meter;
use crate::mqtt::ha_interface::HaDiscover;
use crate::mqtt::{get_app_status, publish_account_state, publish_meter_state, MqttConnectionStatus, Transmission};
use crate::services::events::ServiceEvent;
use crate::services::{CreateTicketCall, PushReadingsCall, SearchClassifiersCall, ServiceError, ServiceHandler};

/// Shared by all workers of the HTTP server
#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ServiceHandler>,
    pub sender: Sender<Transmission>,
    pub events: tokio::sync::broadcast::Sender<String>,
    pub ha_enabled: bool,
}

pub struct ApiManager {
    state: AppState,
    config: HttpdConfig,
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub mqtt: MqttHealthInfo,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Serialize, ToSchema)]
pub struct MqttHealthInfo {
    pub status: String,
    pub last_connected_ago_seconds: Option<u64>,
    pub last_message_sent_ago_seconds: Option<u64>,
    pub last_message_received_ago_seconds: Option<u64>,
    pub connection_attempts: u64,
}

/// Per target outcome of a service call, either the fired event or why none was fired
#[derive(Serialize)]
#[serde(untagged)]
pub enum ServiceOutcome {
    Event(ServiceEvent),
    Error { error: String },
}

fn error_response(e: &ServiceError) -> HttpResponse {
    let body = serde_json::json!({ "error": e.to_string() });
    match e {
        ServiceError::AccountNotFound(_) => HttpResponse::NotFound().json(body),
        ServiceError::Client(_) => HttpResponse::BadGateway().json(body),
        ServiceError::Readings(_) | ServiceError::Validation(_) => HttpResponse::BadRequest().json(body),
    }
}

async fn fire(state: &AppState, event: &ServiceEvent) {
    if state.sender.send(Transmission::Event(event.clone())).await.is_err() {
        error!("Unable to queue event {}", event.event_type);
    }
}

async fn publish_states(state: &AppState) {
    for meter in state.services.store().meters() {
        publish_meter_state(&state.sender, &meter).await;
    }
    for account in state.services.store().accounts() {
        publish_account_state(&state.sender, &account).await;
    }
}

fn persist_accounts(state: &AppState) {
    let accounts = state.services.store().accounts();
    CONFIG.write().unwrap_or_else(PoisonError::into_inner).update_accounts(accounts);
}

#[utoipa::path(get,
    path = "/health",
    summary = "Health check endpoint for container monitoring",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy")
    ),
)]
async fn health_check() -> impl Responder {
    let app_status = get_app_status().await;
    let mqtt_health = &app_status.mqtt_health;
    let now = std::time::Instant::now();
    let system_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let last_connected_ago = mqtt_health.last_connected
        .map(|t| now.duration_since(t).as_secs());
    let last_message_sent_ago = mqtt_health.last_message_sent
        .map(|t| now.duration_since(t).as_secs());
    let last_message_received_ago = mqtt_health.last_message_received
        .map(|t| now.duration_since(t).as_secs());

    let mqtt_status = match &mqtt_health.status {
        MqttConnectionStatus::Connected => "connected",
        MqttConnectionStatus::Disconnected => "disconnected",
        MqttConnectionStatus::Reconnecting => "reconnecting",
        MqttConnectionStatus::Error(_) => "error",
    };

    let overall_healthy = matches!(mqtt_health.status, MqttConnectionStatus::Connected);

    let response = HealthResponse {
        status: if overall_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        mqtt: MqttHealthInfo {
            status: mqtt_status.to_string(),
            last_connected_ago_seconds: last_connected_ago,
            last_message_sent_ago_seconds: last_message_sent_ago,
            last_message_received_ago_seconds: last_message_received_ago,
            connection_attempts: mqtt_health.connection_attempts,
        },
        uptime_seconds: app_status.uptime_seconds(),
        timestamp: system_time,
    };

    if overall_healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

#[utoipa::path(get,
    path = "/api/v1/config",
    summary = "Get the whole configuration as stored in the memory of the application, secrets masked",
    responses(
        (status = 200, description = "Get current running config")
    ),
)]
async fn get_config() -> impl Responder {
    let mut config = config_snapshot();
    if !config.mqtt.pass.is_empty() {
        config.mqtt.pass = "***".to_string();
    }
    HttpResponse::Ok().content_type("application/json").json(config)
}

#[utoipa::path(get,
    path = "/api/v1/meters",
    summary = "Get all meters with their tariff values",
    responses(
        (status = 200, description = "Meters of all accounts", body = Vec<Meter>)
    ),
)]
async fn get_meters(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.services.store().meters())
}

#[utoipa::path(post,
    path = "/api/v1/services/push_readings",
    summary = "Submit readings for one or more meters",
    request_body (content = PushReadingsCall, description = "Targets, readings and flags", content_type = "application/json"),
    responses(
        (status = 200, description = "One outcome per target, at least one event fired"),
        (status = 400, description = "No target passed validation")
    ),
)]
async fn push_readings(state: web::Data<AppState>, call: web::Json<PushReadingsCall>) -> impl Responder {
    let call = call.into_inner();
    info!("push_readings requested for {} target(s)", call.entity_id.len());

    let mut fired = false;
    let mut outcomes = Vec::new();
    for outcome in state.services.push_readings(&call, Local::now().date_naive()) {
        match outcome {
            Ok(event) => {
                fired = true;
                fire(&state, &event).await;
                outcomes.push(ServiceOutcome::Event(event));
            },
            Err(e) => {
                warn!("push_readings rejected: {e}");
                outcomes.push(ServiceOutcome::Error { error: e.to_string() });
            },
        }
    }

    if !fired {
        return HttpResponse::BadRequest().json(outcomes);
    }

    publish_states(&state).await;
    persist_accounts(&state);
    HttpResponse::Ok().json(outcomes)
}

#[utoipa::path(post,
    path = "/api/v1/services/create_ticket",
    summary = "Create a support ticket for an account",
    request_body (content = CreateTicketCall, description = "Account, classifier and message", content_type = "application/json"),
    responses(
        (status = 200, description = "The event fired for the call"),
        (status = 400, description = "Invalid call data"),
        (status = 404, description = "Unknown account")
    ),
)]
async fn create_ticket(state: web::Data<AppState>, call: web::Json<CreateTicketCall>) -> impl Responder {
    match state.services.create_ticket(&call) {
        Ok(event) => {
            fire(&state, &event).await;
            if state.ha_enabled && event.success() {
                if let Some(account) = state.services.store().account(&call.account_id) {
                    let _ = state.sender.send(Transmission::AutoDiscovery(HaDiscover::for_account(&account))).await;
                }
            }
            publish_states(&state).await;
            persist_accounts(&state);
            HttpResponse::Ok().json(event)
        },
        Err(e) => {
            warn!("create_ticket rejected: {e}");
            error_response(&e)
        },
    }
}

#[utoipa::path(post,
    path = "/api/v1/services/search_ticket_classifiers",
    summary = "Search ticket classifiers by name",
    request_body (content = SearchClassifiersCall, description = "Query and result options", content_type = "application/json"),
    responses(
        (status = 200, description = "The event fired for the call"),
        (status = 400, description = "Invalid call data"),
        (status = 502, description = "Classifiers could not be fetched")
    ),
)]
async fn search_ticket_classifiers(state: web::Data<AppState>, call: web::Json<SearchClassifiersCall>) -> impl Responder {
    match state.services.search_ticket_classifiers(&call) {
        Ok(event) => {
            fire(&state, &event).await;
            HttpResponse::Ok().json(event)
        },
        Err(e) => {
            warn!("search_ticket_classifiers rejected: {e}");
            error_response(&e)
        },
    }
}

/// Next message for a websocket, a slow client skips what it missed. `None` once the channel is closed.
async fn next_broadcast<T: Clone>(receiver: &mut tokio::sync::broadcast::Receiver<T>, stream: &str) -> Option<T> {
    loop {
        match receiver.recv().await {
            Ok(msg) => return Some(msg),
            Err(RecvError::Lagged(skipped)) => warn!("{stream} websocket too slow, {skipped} message(s) skipped"),
            Err(RecvError::Closed) => return None,
        }
    }
}

// Websocket to push fired events to the client
#[utoipa::path(get,
    path = "/api/v1/ws/events",
    summary = "Websocket to get live service events",
    responses(
        (status = 101, description = "The websocket is active and receives every fired event"),
    ),
)]
async fn ws_events(req: HttpRequest, body: web::Payload, state: web::Data<AppState>) -> actix_web::Result<impl Responder> {
    let (response, mut session, mut _msg_stream) = actix_ws::handle(&req, body)?;

    let mut thread_receiver = state.events.subscribe();
    actix_web::rt::spawn(async move {
        while let Some(msg) = next_broadcast(&mut thread_receiver, "event").await {
            if session.text(msg).await.is_err() {
                break;
            }
        }

        let _ = session.close(None).await;
    });

    Ok(response)
}

// Websocket to push config changes to the client
#[utoipa::path(get,
    path = "/api/v1/ws/configChanges",
    summary = "Websocket to get changes of the configuration",
    responses(
        (status = 101, description = "The websocket is active and receives every config change"),
    ),
)]
async fn ws_config_changes(req: HttpRequest, body: web::Payload) -> actix_web::Result<impl Responder> {
    let (response, mut session, mut _msg_stream) = actix_ws::handle(&req, body)?;

    let mut thread_receiver = CONFIG.read().unwrap_or_else(PoisonError::into_inner).get_change_receiver();
    actix_web::rt::spawn(async move {
        while let Some(change) = next_broadcast(&mut thread_receiver, "config").await {
            let Ok(msg) = serde_json::to_string(&change) else {
                continue;
            };
            if session.text(msg).await.is_err() {
                break;
            }
        }

        let _ = session.close(None).await;
    });

    Ok(response)
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/api/v1/config", web::get().to(get_config))
        .route("/api/v1/meters", web::get().to(get_meters))
        .route("/api/v1/services/push_readings", web::post().to(push_readings))
        .route("/api/v1/services/create_ticket", web::post().to(create_ticket))
        .route("/api/v1/services/search_ticket_classifiers", web::post().to(search_ticket_classifiers))
        .route("/api/v1/ws/events", web::get().to(ws_events))
        .route("/api/v1/ws/configChanges", web::get().to(ws_config_changes));
}

#[derive(OpenApi)]
#[openapi(
    info(description = "pikcomfort2mqtt API description"),
    paths(
            health_check,
            get_config,
            get_meters,
            push_readings,
            create_ticket,
            search_ticket_classifiers,
            ws_events,
            ws_config_changes,
    )
)]
struct ApiDoc;

impl ApiManager {
    pub fn new(state: AppState, config: HttpdConfig) -> Self {
        return ApiManager { state, config };
    }

    pub async fn start_thread(&self) {
        if !self.config.enabled {
            info!("Webserver disabled by config");
            return std::future::pending::<()>().await;
        }

        /* Only the running server handle may live across the await, the builder is not Send */
        let server = {
            let state = web::Data::new(self.state.clone());
            let bound = HttpServer::new(move || {
                App::new()
                    .app_data(state.clone())
                    .configure(routes)
                    .service(
                        SwaggerUi::new("/swagger-ui/{_:.*}")
                            .url("/api/v1/openapi.json", ApiDoc::openapi()),
                    )
            })
            .bind(format!("0.0.0.0:{}", self.config.port));

            match bound {
                Ok(server) => server.run(),
                Err(e) => {
                    error!("Unable to bind webserver to port {}: {e}", self.config.port);
                    return;
                },
            }
        };

        info!("Webserver listening on port {}", self.config.port);
        if let Err(e) = server.await {
            error!("Webserver stopped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use crate::accounts::{AccountStore, OutboxClient};
    use crate::models::{Account, TariffZone, TicketClassifier, Zone};
    use crate::readings::PolicyEngine;

    const ACCOUNT_ID: &str = "0a1b2c3d-0000-4000-8000-000000000001";
    const CLASSIFIER_ID: &str = "aaaaaaaa-0000-4000-8000-000000000002";

    fn state() -> (AppState, tokio::sync::mpsc::Receiver<Transmission>) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let (events, _) = tokio::sync::broadcast::channel(16);
        let account = Account {
            id: ACCOUNT_ID.to_string(),
            number: None,
            address: None,
            meters: vec![Meter::new("m1", vec![TariffZone::new(Zone::T1, 10.0), TariffZone::new(Zone::T2, 20.0)])],
            tickets: Vec::new(),
            last_payment: None,
            last_receipt: None,
        };
        let classifiers = vec![TicketClassifier { id: CLASSIFIER_ID.to_string(), name: "Broken lift".to_string(), parent_id: None, has_children: false }];
        let store = Arc::new(AccountStore::new(vec![account], Arc::new(OutboxClient::new(tx.clone(), classifiers))));
        let services = Arc::new(ServiceHandler::new(store, PolicyEngine::default(), "PIK Comfort", "79001234567"));
        (AppState { services, sender: tx, events, ha_enabled: true }, rx)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[::core::prelude::v1::test]
    fn test_start_thread_can_be_spawned() {
        let (state, _rx) = state();
        let api = ApiManager::new(state, HttpdConfig { enabled: false, port: 0 });
        let fut = api.start_thread();
        assert_send(&fut);
    }

    #[tokio::test]
    async fn test_slow_websocket_skips_missed_messages() {
        let (tx, mut rx) = tokio::sync::broadcast::channel(2);
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        assert_eq!(next_broadcast(&mut rx, "test").await, Some(3));
        assert_eq!(next_broadcast(&mut rx, "test").await, Some(4));
        drop(tx);
        assert_eq!(next_broadcast(&mut rx, "test").await, None);
    }

    #[actix_rt::test]
    async fn test_get_meters() {
        let (state, _rx) = state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;
        let req = test::TestRequest::get().uri("/api/v1/meters").to_request();
        let meters: Vec<Meter> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(meters.len(), 1);
        assert_eq!(meters[0].uid, "m1");
    }

    #[actix_rt::test]
    async fn test_push_readings_fires_events() {
        let (state, mut rx) = state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/api/v1/services/push_readings")
            .set_json(serde_json::json!({"entity_id": ["m1", "nope"], "readings": "15 25", "ignore_periods": true}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body[0]["data"]["success"], true);
        assert_eq!(body[1]["data"]["comment"], "Meter is unavailable");

        let mut events = 0;
        while let Ok(t) = rx.try_recv() {
            if let Transmission::Event(_) = t {
                events += 1;
            }
        }
        assert_eq!(events, 2);
    }

    #[actix_rt::test]
    async fn test_push_readings_all_invalid() {
        let (state, _rx) = state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/api/v1/services/push_readings")
            .set_json(serde_json::json!({"entity_id": "m1", "readings": "1 2 3"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body[0]["error"].as_str().unwrap().contains("tariff zone"));
    }

    #[actix_rt::test]
    async fn test_create_ticket_status_codes() {
        let (state, mut rx) = state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/services/create_ticket")
            .set_json(serde_json::json!({"account_id": ACCOUNT_ID, "classifier_id": CLASSIFIER_ID, "message": "Lift is stuck"}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["event_type"], "pik_comfort_create_ticket");
        assert_eq!(body["data"]["success"], true);

        let mut ticket_sensors = 0;
        let mut account_states = 0;
        while let Ok(t) = rx.try_recv() {
            match t {
                Transmission::AutoDiscovery(d) => ticket_sensors = d.cmps.keys().filter(|k| k.starts_with("ticket_")).count(),
                Transmission::Publish(p) if p.topic.starts_with("pik_comfort/accounts/") => {
                    let state: serde_json::Value = serde_json::from_str(&p.payload).unwrap();
                    assert_eq!(state["tickets"].as_object().unwrap().len(), 1);
                    account_states += 1;
                },
                _ => {},
            }
        }
        assert_eq!(ticket_sensors, 1);
        assert_eq!(account_states, 1);

        let req = test::TestRequest::post()
            .uri("/api/v1/services/create_ticket")
            .set_json(serde_json::json!({"account_id": "ffffffff-0000-4000-8000-000000000000", "classifier_id": CLASSIFIER_ID, "message": "Lift"}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::post()
            .uri("/api/v1/services/create_ticket")
            .set_json(serde_json::json!({"account_id": ACCOUNT_ID, "classifier_id": CLASSIFIER_ID, "message": " "}))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn test_search_ticket_classifiers() {
        let (state, _rx) = state();
        let app = test::init_service(App::new().app_data(web::Data::new(state)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/api/v1/services/search_ticket_classifiers")
            .set_json(serde_json::json!({"query": "lift"}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["count"], 1);
        assert_eq!(body["notification"]["title"], "Ticket classifier search results");
    }
}
