use geochat::{config::Config, presence::Presence, router, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("geochat=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let app_state = AppState::new(Presence::new(config.max_online_users));
    let app = router(app_state);

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        max_online_users = ?config.max_online_users,
        "geochat v{} listening",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, app).await?;
    Ok(())
}
