use actix_web::{App, HttpServer};
use chat_relay::{
    auth::HmacTokenVerifier,
    config, db, error, logging, routes,
    services::NotificationListener,
    state::AppState,
    store::{PgNotificationSource, PgStore},
};
use std::sync::Arc;
use tokio::task::JoinHandle;

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    let store = Arc::new(PgStore::new(pool, cfg.listener.channel.clone()));
    let notifications = Arc::new(PgNotificationSource::new(
        cfg.database_url.clone(),
        cfg.listener.channel.clone(),
    ));
    let auth = Arc::new(HmacTokenVerifier::new(&cfg.token_secret, cfg.token_ttl));

    let state = AppState::new(cfg.clone(), store.clone(), store.clone(), auth);

    // Fan committed messages out to local rooms
    let listener = NotificationListener::new(
        notifications,
        store,
        state.registry.clone(),
        &cfg.listener,
    );
    let _listener_task: JoinHandle<()> = tokio::spawn(listener.run());

    let relay_addr = format!("0.0.0.0:{}", cfg.ws_port);
    let relay_state = state.clone();
    let relay_task = tokio::spawn(async move {
        routes::wsroute::serve(&relay_addr, relay_state).await
    });

    let http_addr = format!("0.0.0.0:{}", cfg.http_port);
    tracing::info!(%http_addr, "starting chat-relay health and metrics server");

    // actix-web HttpServer futures are not Send, so it runs in the foreground
    let http_server = HttpServer::new(|| App::new().configure(routes::health::configure))
        .workers(1)
        .bind(&http_addr)
        .map_err(|e| error::AppError::StartServer(format!("bind HTTP: {e}")))?
        .run();

    tokio::select! {
        res = http_server => {
            res.map_err(|e| error::AppError::StartServer(format!("HTTP server: {e}")))?;
            Ok(())
        }
        res = relay_task => {
            res.map_err(|e| error::AppError::StartServer(format!("relay task join: {e}")))??;
            Ok(())
        }
    }
}
