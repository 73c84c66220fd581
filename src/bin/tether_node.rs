use std::{error::Error, path::PathBuf, sync::mpsc, time::Duration};

use clap::Parser;
use log::{debug, info, warn};
use tether::{
    DeliveryMode, Delivery, DirectoryChain, DriverRegistry, Registration, Transport,
    TransportConfig,
    directory::{Directory, Entry, FileDirectory},
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for connections at URL, e.g. tcp://127.0.0.1:7000
    #[arg(short, long, required = true)]
    listen: Vec<String>,
    /// Name the echo service registers under
    #[arg(short, long, default_value = "echo")]
    name: String,
    /// Directory file the service locations are published in
    #[arg(short, long)]
    directory: Option<PathBuf>,
    /// Qualifier published locations are filed under
    #[arg(short, long, default_value = "")]
    qualifier: String,
    /// Seconds between liveness chirps; 0 disables them
    #[arg(long, default_value_t = 30)]
    chirp: u64,
    /// Threads running the receive handler
    #[arg(long, default_value_t = 4)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = TransportConfig {
        qualifier: cli.qualifier.clone(),
        chirp_interval: (cli.chirp > 0).then(|| Duration::from_secs(cli.chirp)),
        delivery: DeliveryMode::Queued {
            capacity: 1024,
            workers: cli.workers.max(1),
        },
        ..Default::default()
    };
    let transport = Transport::new(config, DriverRegistry::with_defaults(), DirectoryChain::new())?;

    let mut bound = Vec::new();
    for url in &cli.listen {
        bound.push(transport.listen(url)?);
    }

    let echo = transport.clone();
    let id = transport.register(
        Registration::new(cli.name.as_str())
            .on_receive(move |delivery| answer(&echo, delivery)),
    )?;
    info!("service '{}' registered as {id} on {bound:?}", cli.name);

    let directory = match &cli.directory {
        Some(path) => Some(FileDirectory::open(path)?),
        None => None,
    };
    let targets = [cli.name.clone(), id.to_string()];
    if let Some(directory) = &directory {
        for url in &bound {
            for target in &targets {
                directory.add(Entry::new(&cli.qualifier, target, url))?;
            }
        }
        directory.commit()?;
        info!("published to {}", directory.path().display());
    }

    let (stop, stopped) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })?;
    stopped.recv()?;

    if let Some(directory) = &directory {
        for url in &bound {
            for target in &targets {
                directory.delete(&cli.qualifier, target, Some(url))?;
            }
        }
        directory.commit()?;
    }
    transport.shutdown();
    Ok(())
}

/// Sends the body of every request back to its sender.
fn answer(transport: &Transport, delivery: Delivery) {
    let Delivery {
        service,
        message,
        reply,
    } = delivery;
    if reply.route() == 0 {
        debug!("service {service} got a message that expects no reply");
        if let Err(e) = transport.free(message) {
            warn!("{e}");
        }
        return;
    }

    let mut echoed = transport.allocate(0);
    echoed.put_bytes(message.body());
    if let Err(e) = transport.free(message) {
        warn!("{e}");
    }
    if let Err(e) = transport.send_via_return(echoed, &reply) {
        warn!("service {service} could not reply over {}: {e}", reply.url());
    }
}
