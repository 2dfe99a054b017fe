pub mod config;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use self::{config::Config, statistics::Statistics};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "rdma-broker.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the broker crate directly, a
/// function is opened to replace the main function and start the
/// server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{} starting", SOFTWARE);

    let statistics = Statistics::default();
    server::run(config, statistics).await
}
