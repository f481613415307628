use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use dfvideo::inference::load_model;
use dfvideo::routes::configure_routes;
use dfvideo::{AppConfig, Analyzer};
use std::env;
use std::io;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    }

    let config = AppConfig::load().map_err(|e| {
        log::error!("{}", e);
        io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let model = load_model(&config.model.path);
    if !model.is_loaded() {
        log::warn!("Starting without a model; analysis requests will be rejected");
    }

    let analyzer = Analyzer::from_config(&config, model).map_err(|e| {
        log::error!("Failed to build HTTP client: {}", e);
        io::Error::other(e.to_string())
    })?;

    let static_dir = Some(config.server.static_dir.clone()).filter(|dir| dir.is_dir());
    if static_dir.is_none() {
        log::info!(
            "Static directory {} not found, serving API only",
            config.server.static_dir.display()
        );
    }

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    log::info!(
        "Starting server on {} (upload limit {} MB)",
        bind_address,
        config.media.max_megabytes
    );

    let analyzer = web::Data::new(analyzer);
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(analyzer.clone())
            .configure(|cfg| configure_routes(cfg, static_dir.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
