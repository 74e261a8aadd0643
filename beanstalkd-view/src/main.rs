/**
 * BEANSTALKD-VIEW - Point d'entrée du tableau de bord
 *
 * RÔLE : Charge la configuration (fichier, BEANSTALK_URL, CLI), ouvre le pool
 * de connexions beanstalkd puis sert l'API HTTP.
 *
 * Une instance injoignable au démarrage est ignorée ; si aucune ne répond,
 * le serveur démarre quand même et chaque vue renvoie 503.
 */

use anyhow::Context;
use beanstalkd_view::config::{load_config, Args, DEFAULT_CONFIG_PATH};
use beanstalkd_view::{http, AppState, Pool};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let mut cfg = load_config(&config_path).await;
    cfg.apply_overrides(std::env::var("BEANSTALK_URL").ok().as_deref(), &args);

    tracing::info!("[view] connecting to {} beanstalkd instance(s)", cfg.servers.len());
    let pool = Pool::connect(&cfg.servers, cfg.client_options()).await;
    if pool.is_empty() {
        tracing::error!("[view] no beanstalkd instance reachable, views will report 503");
    }

    let listen = cfg.listen.clone();
    let app = http::build_router(AppState::new(pool, cfg));

    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!("[view] listening on http://{}", listen);
    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}
