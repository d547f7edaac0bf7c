use anyhow::Context;

use mitm_proxy::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("load configuration")?;
    let _log_guard = mitm_proxy::logging::init(&config.logging)?;
    mitm_proxy::run(config).await
}
