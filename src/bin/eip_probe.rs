//! Logix EIP Probe
//!
//! Connects to a controller, prints its identity and services, then reads
//! the tags given on the command line.
//!
//! Usage: eip_probe <address[:port]> [slot] [type:tag ...]
//!        eip_probe --discover [broadcast address]
//!
//! Example: eip_probe 192.168.1.10 0 dint:Count real:Line1.Speed string:Message
//!
//! Set `RUST_LOG=logix_eip=debug` for protocol traces.

use std::net::SocketAddr;
use std::time::Duration;

use logix_eip::{ClientConfig, LogixTcpClient, TagType, UdpChannel, DEFAULT_TCP_PORT};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(target) = args.first() else {
        eprintln!("Usage: eip_probe <address[:port]> [slot] [type:tag ...]");
        eprintln!("       eip_probe --discover [broadcast address]");
        std::process::exit(2);
    };

    if target == "--discover" {
        let broadcast = args.get(1).map(String::as_str).unwrap_or("255.255.255.255");
        return discover(broadcast).await;
    }

    let (slot, tags) = match args.get(1).and_then(|s| s.parse::<u8>().ok()) {
        Some(slot) => (slot, &args[2..]),
        None => (0, &args[1..]),
    };

    let config = ClientConfig::new().with_slot(slot);
    let client = LogixTcpClient::from_address(target, config)?;
    println!("Connecting to {} (slot {})...", client.target(), slot);
    if !client.wait_for_connection().await {
        let cause = client
            .fault_cause()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "timed out".to_string());
        eprintln!("Connection failed: {}", cause);
        std::process::exit(1);
    }

    match client.get_device_identity().await? {
        Some(identity) => println!("Identity: {}", identity),
        None => println!("Identity: not reported"),
    }
    for service in client.get_device_services().await? {
        println!(
            "Service: {} (CIP over TCP: {}, UDP: {})",
            service.name,
            service.supports_cip_over_tcp(),
            service.supports_cip_over_udp()
        );
    }

    for spec in tags {
        let (tag_type, tag) = match spec.split_once(':') {
            Some((ty, tag)) if ty.parse::<TagType>().is_ok() => (ty.parse::<TagType>()?, tag),
            _ => (TagType::Int32, spec.as_str()),
        };
        match client.read_value(tag, tag_type).await {
            Ok(value) => println!("{} ({}) = {}", tag, tag_type, value),
            Err(e) => println!("{} ({}) failed: {}", tag, tag_type, e),
        }
    }

    if let Some(stats) = client.transport_stats().await {
        println!(
            "Requests: {}, responses: {}, bytes out/in: {}/{}",
            stats.requests_sent, stats.responses_received, stats.bytes_sent, stats.bytes_received
        );
    }
    client.close().await?;
    Ok(())
}

async fn discover(broadcast: &str) -> Result<(), Box<dyn std::error::Error>> {
    let broadcast: SocketAddr = match broadcast.parse() {
        Ok(addr) => addr,
        Err(_) => SocketAddr::new(broadcast.parse()?, DEFAULT_TCP_PORT),
    };
    println!("Broadcasting ListIdentity to {}...", broadcast);
    let found = UdpChannel::discover(broadcast, Duration::from_secs(2)).await?;
    if found.is_empty() {
        println!("No devices answered");
    }
    for (addr, identity) in found {
        println!("{}: {}", addr, identity);
    }
    Ok(())
}
