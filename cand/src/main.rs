mod config;
mod util;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use canio::{Distributor, Driver, Subscription, VirtualDriver};
use clap::ArgAction;
use futures::StreamExt;
use tokio::task;

use config::{Backend, Config};

fn args() -> clap::Command {
    clap::command!().arg(
        clap::Arg::new("config")
            .short('c')
            .long("config")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(PathBuf))
            .help("Path to the configuration file")
            .default_value("cand.toml"),
    )
}

fn driver(config: &Config) -> Arc<dyn Driver> {
    match &config.backend {
        Backend::Virtual { bitrate } => {
            let driver = VirtualDriver::new();
            driver.set_bus_bitrate(*bitrate);
            Arc::new(driver)
        }
        #[cfg(all(feature = "socketcan", target_os = "linux"))]
        Backend::SocketCAN {
            interface,
            link_command,
        } => Arc::new(
            canio::driver::socketcan::SocketCanDriver::new()
                .with_interface(config.device.number, interface.as_str())
                .with_link_command(link_command.clone()),
        ),
    }
}

async fn log_frames(mut frames: Subscription) -> anyhow::Result<()> {
    while let Some(frame) = frames.next().await {
        log::info!("{}", frame);
    }
    log::debug!("subscription {} closed", frames.id());
    Ok(())
}

async fn log_stats(can: Arc<Distributor>, every: Duration) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = can.stats();
        log::info!(
            "received {} (errors {}), bus load {}%",
            stats.received,
            stats.receive_errors,
            can.bus_load()?
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let matches = args().get_matches();
    let path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from("cand.toml"));
    let config = Config::load(&path)?;

    let driver = driver(&config);
    let can = Arc::new(canio::open(driver, &config.device)?);
    can.start()?;

    task::spawn(util::catch_error(log_frames(can.subscribe()?)));
    let stats = (config.stats_interval > 0).then(|| {
        task::spawn(util::catch_error(log_stats(
            can.clone(),
            Duration::from_secs(config.stats_interval),
        )))
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    if let Some(stats) = stats {
        stats.abort();
    }
    can.stop().await?;

    Ok(())
}
