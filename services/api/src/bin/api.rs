//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, FileSystemObjectStorage, HttpImageAdapter, OpenAiTextAdapter},
    config::Config,
    error::ApiError,
    web::{
        auth::{login_handler, logout_handler, signup_handler},
        books::{
            generate_book_handler, get_book_handler, latest_book_handler, set_visibility_handler,
        },
        jobs::{get_job_handler, open_job_handler},
        pages::{
            apply_new_image_handler, refine_page_image_handler, regenerate_page_image_handler,
        },
        require_auth,
        rest::points_handler,
        state::AppState,
        ApiDoc,
    },
};
use async_openai::{config::OpenAIConfig, Client};
use axum::http::{
    header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use storybook_core::BookStudio;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize Service Adapters ---
    let openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    let text_adapter = Arc::new(OpenAiTextAdapter::new(
        Client::with_config(openai_config),
        config.text_model.clone(),
    ));
    let image_adapter = Arc::new(HttpImageAdapter::new(
        config.image_api_url.clone(),
        config.image_api_key.clone(),
    )?);
    let storage =
        Arc::new(FileSystemObjectStorage::new(&config.storage_dir, &config.public_base_url).await?);

    // --- 4. Build the Shared AppState ---
    let studio = Arc::new(BookStudio::new(
        db_adapter.clone(),
        text_adapter,
        image_adapter,
        storage,
        config.studio_settings(),
    ));
    let app_state = Arc::new(AppState {
        db: db_adapter,
        config: config.clone(),
        studio,
    });

    // --- 5. Create the Web Router ---
    let origin = config.cors_origin.parse::<HeaderValue>().map_err(|e| {
        ApiError::Internal(format!("Invalid CORS_ORIGIN '{}': {}", config.cors_origin, e))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/generate", post(generate_book_handler))
        .route("/regenerate-page-image", post(regenerate_page_image_handler))
        .route("/refine-and-regenerate-page-image", post(refine_page_image_handler))
        .route("/apply-new-image", post(apply_new_image_handler))
        .route("/latest-book-for-current-user", get(latest_book_handler))
        .route("/generation-jobs", post(open_job_handler))
        .route("/generation-jobs/{id}", get(get_job_handler))
        .route("/books/{id}", get(get_book_handler))
        .route("/books/{id}/visibility", post(set_visibility_handler))
        .route("/points", get(points_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .nest_service("/media", ServeDir::new(&config.storage_dir))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received; draining connections.");
}
