use std::path::PathBuf;

use slicecast::config::Config;
use slicecast::ingest::StdinTransport;
use slicecast::pipeline::Service;

fn main() -> anyhow::Result<()> {
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stderr());
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive("slicecast=info".parse()?)
        .from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(non_blocking)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&PathBuf::from(path))?,
        None => Config::default(),
    };

    let service = Service::start(config, StdinTransport::new())?;
    if !service.join() {
        anyhow::bail!("frame stream never spoke the wire protocol");
    }

    Ok(())
}
