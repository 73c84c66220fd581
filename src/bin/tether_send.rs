use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tether::{
    DirectoryChain, DriverRegistry, SendOptions, Target, Transport, TransportConfig,
    directory::FileDirectory,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory file listing where targets live
    directory: PathBuf,
    /// Target name, or numeric service id
    target: String,
    /// Text sent as the message body
    payload: String,
    /// Qualifier targets are looked up under
    #[arg(short, long, default_value = "")]
    qualifier: String,
    /// Seconds to wait for the reply
    #[arg(short, long, default_value_t = 10)]
    timeout: u64,
    /// Send without waiting for a reply
    #[arg(long)]
    no_wait: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = TransportConfig {
        qualifier: cli.qualifier.clone(),
        chirp_interval: None,
        ..Default::default()
    };
    let directory = DirectoryChain::new().with(Arc::new(FileDirectory::open(&cli.directory)?));
    let transport = Transport::new(config, DriverRegistry::with_defaults(), directory)?;

    let target = match cli.target.parse::<i32>() {
        Ok(id) => Target::Id(id),
        Err(_) => Target::Name(cli.target.clone()),
    };
    let mut message = transport.allocate(0);
    message.put_bytes(cli.payload.as_bytes());

    if cli.no_wait {
        transport.send(target, message, SendOptions::new())?;
    } else {
        let timeout = Duration::from_secs(cli.timeout);
        let reply = transport.send_and_wait(target, message, Some(timeout))?;
        println!("{}", String::from_utf8_lossy(reply.body()));
        transport.free(reply)?;
    }

    transport.shutdown();
    Ok(())
}
