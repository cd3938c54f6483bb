#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use relay_server::config::Config;

fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log_level())?;

    // The data plane is one cooperative worker: every connection suspends at
    // its readiness points and nothing else preempts it.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(relay_server::startup(config))
}
