use std::{cell::RefCell, rc::Rc};

use anyhow::Context;
use clap::Parser;
use evaio::{
    cli::Cli,
    conf::{Config, DeviceConf, OutputFormat},
    consumer::{self, Consumer},
    Device, DeviceError, DeviceOptions, Runtime, Shutdown,
};
use nix::sys::signal::Signal;
use tracing_subscriber::EnvFilter;

/// Streams one device into the consumer until it closes, hits its limit or
/// gets interrupted by shutdown.
async fn pump(
    device: Device,
    conf: DeviceConf,
    format: OutputFormat,
    sink: Rc<RefCell<Consumer>>,
    shutdown: Rc<Shutdown>,
) {
    let name = conf.display_name();
    let mut emitted = 0u64;

    while !shutdown.is_triggered() && conf.limit.map_or(true, |limit| emitted < limit) {
        let event = match device.get().await {
            Ok(event) => event,
            Err(DeviceError::Interrupted) => break,
            Err(DeviceError::Closed) => {
                tracing::info!(device = %name, "device closed");
                return;
            }
            Err(e) => {
                tracing::error!(device = %name, "read failed: {e}");
                return;
            }
        };
        if !conf.accepts(event.kind) {
            continue;
        }

        let written = consumer::render(&name, &event, format)
            .and_then(|line| sink.borrow_mut().write(&line));
        if let Err(e) = written {
            tracing::error!(device = %name, "failed to write event: {e}");
            break;
        }
        emitted += 1;
    }

    if let Err(e) = device.close() {
        tracing::warn!(device = %name, "close failed: {e}");
    }
}

fn run(config: Config) -> anyhow::Result<()> {
    let runtime = Runtime::new().context("failed to set up the reactor")?;
    let shutdown = Rc::new(
        Shutdown::install(runtime.watcher(), &[Signal::SIGINT, Signal::SIGTERM])
            .context("failed to install signal handling")?,
    );
    let sink = Rc::new(RefCell::new(
        Consumer::from_conf(&config.output).context("failed to open output")?,
    ));
    let options = DeviceOptions {
        close_policy: config.close_policy,
    };

    let mut started = 0;
    for conf in config.device {
        let device = match Device::open_with(runtime.watcher(), &conf.path, options) {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(path = %conf.path.display(), "failed to open device: {e}");
                continue;
            }
        };
        tracing::info!(device = %conf.display_name(), "reading");
        shutdown.watch(device.interrupter());
        runtime.spawn(pump(
            device,
            conf,
            config.format,
            sink.clone(),
            shutdown.clone(),
        ));
        started += 1;
    }

    anyhow::ensure!(started > 0, "no device could be opened");
    runtime.run()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.resolve()?;

    if let Err(err) = run(config) {
        tracing::error!("{err:#}");
        return Err(err);
    }
    Ok(())
}
