use std::path::PathBuf;
use std::sync::Arc;

use actix_web::http::header::LOCATION;
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use chrono::Utc;
use log::{error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat_loop::{LoopMonitor, LoopStatus};
use crate::dispatcher::CommandDispatcher;
use crate::google_auth::{write_token, ConsentFlow};
use crate::runs::RunStatus;

pub struct ApiState {
    pub dispatcher: Arc<CommandDispatcher>,
    pub monitor: LoopMonitor,
}

#[derive(Serialize)]
struct Health {
    chat: LoopStatus,
    queued_runs: usize,
    running_runs: usize,
    in_flight_tasks: usize,
}

/// List every tracked run, newest first
///
/// # Example
/// ```shell
/// curl http://localhost:8080/runs
/// ```
#[get("/runs")]
pub async fn list_runs(state: web::Data<ApiState>) -> impl Responder {
    HttpResponse::Ok().json(state.dispatcher.registry().list())
}

/// Get a single run by id
///
/// # Example
/// ```shell
/// curl http://localhost:8080/runs/2f1c6a0e-0b5e-4b8e-9a41-8c1d2b7f0a11
/// ```
///
/// # Returns
/// ```json
/// {
///   "id": "2f1c6a0e-...",
///   "status": "succeeded",
///   "url": "https://youtube.com/shorts/abc"
/// }
/// ```
#[get("/runs/{id}")]
pub async fn get_run(state: web::Data<ApiState>, path: web::Path<String>) -> impl Responder {
    let Ok(id) = Uuid::parse_str(&path) else {
        return HttpResponse::BadRequest().body("run id must be a UUID");
    };
    match state.dispatcher.registry().get(id) {
        Some(run) => HttpResponse::Ok().json(run),
        None => HttpResponse::NotFound().body(format!("no run {}", id)),
    }
}

/// Poll-loop state and run counters
#[get("/health")]
pub async fn health(state: web::Data<ApiState>) -> impl Responder {
    let registry = state.dispatcher.registry();
    HttpResponse::Ok().json(Health {
        chat: state.monitor.snapshot(),
        queued_runs: registry.count_with_status(RunStatus::Queued),
        running_runs: registry.count_with_status(RunStatus::Running),
        in_flight_tasks: state.dispatcher.in_flight(),
    })
}

/// Run the API server
pub async fn run_api_server(
    bind: String,
    dispatcher: Arc<CommandDispatcher>,
    monitor: LoopMonitor,
) -> std::io::Result<()> {
    let state = web::Data::new(ApiState { dispatcher, monitor });
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(list_runs)
            .service(get_run)
            .service(health)
    })
    .bind(bind)?
    .disable_signals()
    .run()
    .await
}

pub struct ConsentState {
    pub flow: ConsentFlow,
    pub token_path: PathBuf,
    pub done: mpsc::Sender<()>,
}

#[derive(Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

/// Send the browser to Google's consent page
#[get("/")]
pub async fn start_consent(state: web::Data<ConsentState>) -> impl Responder {
    match state.flow.authorize_url() {
        Ok(url) => HttpResponse::Found().insert_header((LOCATION, url)).finish(),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Exchange the authorization code and save the token file
#[get("/oauth2callback")]
pub async fn oauth_callback(
    state: web::Data<ConsentState>,
    query: web::Query<CallbackQuery>,
) -> impl Responder {
    if let Some(reason) = &query.error {
        return HttpResponse::BadRequest().body(format!("Authorization denied: {}", reason));
    }
    let Some(code) = &query.code else {
        return HttpResponse::BadRequest().body("No authorization code received");
    };

    let exchanged = match state.flow.exchange_code(code).await {
        Ok(exchanged) => exchanged,
        Err(err) => {
            error!("Token exchange failed: {:#}", err);
            return HttpResponse::BadGateway().body("Error getting token");
        }
    };
    if let Err(err) = write_token(&state.token_path, &exchanged, Utc::now()).await {
        error!("{:#}", err);
        return HttpResponse::InternalServerError().body(err.to_string());
    }
    let _ = state.done.try_send(());
    HttpResponse::Ok().body("Token saved! You can close this window and start the clipper.")
}

/// Serves the consent flow until one token has been saved.
pub async fn run_consent_server(
    bind: String,
    flow: ConsentFlow,
    token_path: PathBuf,
) -> std::io::Result<()> {
    let (done, mut saved) = mpsc::channel(1);
    let state = web::Data::new(ConsentState {
        flow,
        token_path,
        done,
    });
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .service(start_consent)
            .service(oauth_callback)
    })
    .bind(bind.as_str())?
    .disable_signals()
    .shutdown_timeout(5)
    .run();
    info!("🔑 Open http://{} to authorize chat and upload access", bind);

    let handle = server.handle();
    tokio::pin!(server);
    tokio::select! {
        result = &mut server => return result,
        _ = saved.recv() => {}
    }
    handle.stop(true).await;
    server.await
}
