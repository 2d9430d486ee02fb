use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use diagnosis_service::{
    auth::TokenKeys,
    config::Config,
    construct_router,
    disease_info::OpenAiDiseaseInfo,
    model::ModelHost,
    pipeline::Classifier,
    store::Store,
    utils::ensure_model_file,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    let host = Arc::new(ModelHost::not_ready());
    match ensure_model_file(
        &config.model_path,
        config.model_url.as_deref(),
        config.github_token.as_deref(),
    )
    .await
    {
        // A failed load is logged by the host; the service keeps serving.
        Ok(()) => {
            let _ = load_model(&host, &config);
        }
        Err(err) => tracing::error!("Model artifact unavailable: {}", err),
    }

    let store = Store::connect(&config.database_url).await?;
    let disease_info = OpenAiDiseaseInfo::new(
        config.openai_base_url.clone(),
        config.openai_api_key.clone(),
        config.openai_model.clone(),
    );

    let state = Arc::new(AppState {
        classifier: Classifier::new(host),
        store,
        disease_info: Arc::new(disease_info),
        tokens: TokenKeys::new(&config.jwt_secret),
    });

    let app = construct_router(state, config.body_limit_bytes());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Listening on http://{}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(feature = "tensorflow")]
fn load_model(
    host: &ModelHost,
    config: &Config,
) -> Result<(), diagnosis_service::model::ModelLoadError> {
    use diagnosis_service::model::TensorFlowEngine;

    host.load(|| {
        TensorFlowEngine::load(
            &config.model_path,
            &config.input_op,
            &config.output_op,
            config.input_shape(),
        )
    })
}

#[cfg(not(feature = "tensorflow"))]
fn load_model(
    _host: &ModelHost,
    _config: &Config,
) -> Result<(), diagnosis_service::model::ModelLoadError> {
    let err = diagnosis_service::model::ModelLoadError::NoBackend;
    tracing::error!("Error loading model: {} (rebuild with --features tensorflow)", err);
    Err(err)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
