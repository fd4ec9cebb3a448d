use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use pneumo_backend::config::AppConfig;
use pneumo_backend::inference::model::{Model, ModelState};
use pneumo_backend::inference::preprocess::Preprocessor;
use pneumo_backend::routes::{configure_routes, UploadLimits};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, format!("Configuration failed: {}", e))
    })?;

    let model_state = ModelState::from_load(Model::load(&config.model));
    match &model_state {
        ModelState::Available(model) => {
            log::info!("Classifier ready on {:?}", model.device());
        }
        ModelState::Unavailable(e) if config.server.serve_without_model => {
            log::error!(
                "Model could not be loaded ({}); serving static pages only",
                e
            );
        }
        ModelState::Unavailable(e) => {
            log::error!("Application shutdown: Model artifact is missing or corrupt: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Model loading failed: {}", e),
            ));
        }
    }

    let model_state = web::Data::new(model_state);
    let preprocessor = web::Data::new(Preprocessor::new(&config.preprocessing));
    let limits = web::Data::new(UploadLimits {
        max_upload_bytes: config.server.max_upload_bytes,
    });
    let static_dir = config.server.static_dir.clone();
    log::info!("Serving pages from {}", static_dir.display());

    let bind_address = config.bind_address();
    log::info!("Starting server on {}", bind_address);

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
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
            .app_data(model_state.clone())
            .app_data(preprocessor.clone())
            .app_data(limits.clone())
            .configure(|cfg| configure_routes(cfg, static_dir.clone()))
    });
    if let Some(workers) = config.server.workers {
        server = server.workers(workers);
    }

    server.bind(&bind_address)?.run().await
}
