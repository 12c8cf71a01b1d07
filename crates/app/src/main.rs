mod email;
mod members;
mod problem;
mod router;
mod telemetry;

use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use clubhub_mail::MailerClient;
use clubhub_storage::Database;
use clubhub_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let storage = Database::connect(&config.database_url).await?;
    storage.run_migrations().await?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let mailer = MailerClient::new(config.mail.api_key.clone(), config.mail.base_url.clone(), http);

    let state = router::AppState::new(metrics, storage, mailer, config.mail.from_address.clone());

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
