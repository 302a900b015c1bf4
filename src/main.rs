use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};

mod auth;
mod balance;
mod config;
mod error;
mod exchange;
mod ledger;
mod routes;
mod schemas;
mod settlement;
mod store;
mod telemetry;

use crate::auth::SessionKey;
use crate::config::Config;
use crate::routes::AppState;
use crate::store::{InMemoryLedgerStore, LedgerStore, MongoLedgerStore};

fn cors(allowed_origin: Option<&str>) -> Cors {
    match allowed_origin {
        Some(origin) => Cors::default()
            .allowed_origin(origin)
            .allow_any_method()
            .allow_any_header(),
        None => Cors::permissive(),
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config = Config::from_env().map_err(io::Error::other)?;
    telemetry::init(&config);

    let store: Arc<dyn LedgerStore> = match &config.mongodb_uri {
        Some(uri) => {
            let store = MongoLedgerStore::connect(uri, &config.database)
                .await
                .map_err(io::Error::other)?;
            tracing::info!(database = %config.database, "connected to MongoDB");
            Arc::new(store)
        }
        None => {
            tracing::warn!("MONGODB_URI not set, using the in-memory store");
            Arc::new(InMemoryLedgerStore::new())
        }
    };

    let state = web::Data::new(AppState::new(store));
    let session_key = web::Data::new(SessionKey::new(&config.session_secret));
    let allowed_origin = config.cors_allowed_origin.clone();

    tracing::info!(addr = %config.bind_addr, "starting server");
    HttpServer::new(move || {
        App::new()
            .wrap(cors(allowed_origin.as_deref()))
            .app_data(state.clone())
            .app_data(session_key.clone())
            .configure(routes::configure)
    })
    .bind(&config.bind_addr)?
    .run()
    .await
}
