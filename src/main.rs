#![deny(warnings)]

use cats_server::{
    DynError,
    config::Param,
    handler::{AppState, build_router},
    metrics::registry,
    util::http::init_http_client,
};

use clap::Parser;

// 可以在这里进行一些预处理
pub(crate) static PARAM: std::sync::LazyLock<Param> = std::sync::LazyLock::new(Param::parse);

pub fn main() -> Result<(), DynError> {
    // The subscriber reads the local UTC offset, which only works before worker threads exist.
    cats_server::init_log::tracing::init(env!("CARGO_CRATE_NAME"), PARAM.environment)?;
    log::info!(
        "starting in {} with {} worker threads ({} x {})",
        PARAM.environment,
        PARAM.worker_threads(),
        PARAM.web_concurrency,
        PARAM.max_threads
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(PARAM.worker_threads())
        .enable_all()
        .build()?;
    runtime.block_on(serve())
}

async fn serve() -> Result<(), DynError> {
    log::info!("init http client...");
    let client = init_http_client(&PARAM.http_proxy, PARAM.upstream_timeout())?;

    let metrics = registry::global();
    // Register up front so the first scrape does not pay for it.
    metrics.get_or_create();

    let app_state = AppState::new(metrics, client, PARAM.upstream_url.clone(), PARAM.environment);
    cats_server::Server::new(PARAM.port, build_router(app_state))
        .with_idle_timeout(PARAM.idle_timeout())
        .with_drain_timeout(PARAM.drain_timeout())
        .run_until(cats_server::shutdown_signal())
        .await?;
    Ok(())
}
