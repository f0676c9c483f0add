use actix_web::{web, App, HttpServer};
use std::sync::Arc;

use inferswitch::config::GatewayConfig;
use inferswitch::server::config_routes;
use inferswitch::util::{self, AppState};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    util::init_tracing();

    let config = match GatewayConfig::load() {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("configuration error: {:#}", err);
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState::from_config(config));
    let bind_addr = util::env_bind_addr();
    tracing::info!(%bind_addr, "starting inferswitch");

    let server = {
        let state = state.clone();
        HttpServer::new(move || {
            App::new()
                .app_data(web::Data::from(state.clone()))
                .wrap(util::cors_config_from_env())
                .configure(config_routes)
        })
        .bind(&bind_addr)
    };

    let server = match server {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%bind_addr, "failed to bind: {}", err);
            std::process::exit(2);
        }
    };

    server.run().await
}
