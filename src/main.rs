use anyhow::Context;
use log::{error, info};
use std::fs::File;
use std::io;
use std::os::unix::io::AsFd;
use std::process;
use vizserver_service::{FdSink, FdSource};

mod config;

// The server is meant to be spawned by inetd or a similar supervisor, one process per client:
//
//    vizserver <&socket >&socket
//

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let settings = config::obtain();

    // Own duplicates of the standard descriptors so they can be handed to other threads and
    // switched to the non-blocking mode.
    let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    // On a socket both descriptors share one open file, so the output turns non-blocking too.
    let output = FdSink::new(File::from(io::stdout().as_fd().try_clone_to_owned()?));
    let source = FdSource::new(input).context("failed to set up the input descriptor")?;

    let mut server = vizserver_service::start(&settings.service, source, output)?;
    let end = server.run();

    let stats = server.stats();
    if let Some(path) = &settings.stats_file {
        let json = serde_json::to_string_pretty(&stats)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write the session stats to {}", path))?;
        info!("session stats written to {}", path);
    }

    if !end.is_clean() {
        error!("exiting with failure: {}", end);
        process::exit(1);
    }
    Ok(())
}
