use std::{
    io::Write,
    time::Duration,
};

use clap::Parser;
use sdk::BrokerClientBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long to wait for the broker's echo after a send.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// Broker host address
    host: String,
    /// TLS server name (SNI) presented during the handshake
    server_name: String,
    /// Broker control-channel port
    #[arg(long, default_value_t = sdk::DEFAULT_PORT)]
    port: u16,
    /// Verify the broker's certificate chain instead of accepting any
    /// certificate (development default)
    #[arg(long)]
    verify_peer: bool,
    /// RDMA device index to open
    #[arg(long, default_value_t = 0)]
    device_index: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info)?;

    let cli = Cli::parse();
    let mut client = BrokerClientBuilder::new(cli.host, cli.server_name)
        .with_port(cli.port)
        .with_verify_peer(cli.verify_peer)
        .with_device_index(cli.device_index)
        .connect()
        .await?;

    println!(
        "connected: qpn={}, peer qpn={}",
        client.local_params().qp_num,
        client.remote_params().qp_num
    );
    println!("commands: send <text> | write <text> | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        // Any read failure, EOF included, terminates the client.
        let Some(line) = lines.next_line().await? else {
            break;
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "quit" {
            break;
        } else if let Some(text) = line.strip_prefix("send ") {
            client.send(text.as_bytes()).await?;

            match tokio::time::timeout(RESPONSE_TIMEOUT, client.recv()).await {
                Ok(reply) => println!("response: {}", String::from_utf8_lossy(&reply?)),
                Err(_) => println!("send completed, no response within {:?}", RESPONSE_TIMEOUT),
            }
        } else if let Some(text) = line.strip_prefix("write ") {
            client.write(text.as_bytes()).await?;
            println!("write completed");
        } else {
            println!("usage: send <text> | write <text> | quit");
        }
    }

    client.close().await?;
    Ok(())
}
