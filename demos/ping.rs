//! Ping - connect to a programmer and print what it reports.
//!
//! This demo shows:
//! - Building a client with a custom request timeout
//! - Connecting over a serial-to-TCP bridge
//! - Typed device operations and link events
//!
//! # Running
//!
//! Expose the programmer's serial port over TCP (e.g. `ser2net`), then:
//!
//! ```text
//! RUST_LOG=opup_client=debug cargo run --example ping -- 192.168.1.40:2000
//! ```

use std::time::Duration;

use opup_client::{ClientEvent, ProtocolClient, StreamTransport};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opup_client=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2000".to_string());

    let client = ProtocolClient::<StreamTransport<tokio::net::TcpStream>>::builder()
        .request_timeout(Duration::from_millis(500))
        .build(StreamTransport::tcp(addr.as_str()))?;

    // Report link failures as they happen
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::TransportError(message) => eprintln!("link error: {}", message),
                ClientEvent::Disconnected => eprintln!("disconnected"),
                ClientEvent::Unsolicited(frame) => {
                    eprintln!("unsolicited frame: cmd 0x{:02X}", frame.cmd())
                }
                ClientEvent::FrameReceived(_) => {}
            }
        }
    });

    client.connect().await?;
    println!("connected to {}", addr);

    client.ping().await?;
    println!("ping: ok");

    let caps = client.get_caps().await?;
    println!("protocol: {} {} ({})", caps.proto, caps.ver, caps.caps.join(", "));

    let status = client.get_status().await?;
    println!("state: {}, uptime: {:?}", status.state, status.uptime());
    if let Some(free) = status.free_ram {
        println!("free RAM: {} bytes", free);
    }

    match client.spi_scan().await? {
        Some(id) => println!(
            "SPI flash: manufacturer 0x{:02X}, device 0x{:04X}",
            id.manufacturer, id.device
        ),
        None => println!("SPI flash: none"),
    }

    client.close().await?;
    Ok(())
}
