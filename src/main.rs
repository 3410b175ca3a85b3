use signal_relay::config::RelayConfig;
use signal_relay::relay::RelayServer;
use tokio::net::UdpSocket;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match std::env::args().nth(1) {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::default(),
    };

    let server = RelayServer::bind(config).await?;
    let port = server.local_addr()?.port();

    println!("   Signal Relay");
    println!("   Listening on ws://{}:{}/?room=<id>", local_ip().await, port);
    println!("   Press Ctrl+C to stop\n");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
    }
    Ok(())
}

/// First non-loopback IPv4 address, for the startup banner only.
/// Connecting a UDP socket sends nothing; it only selects a route.
async fn local_ip() -> String {
    let route = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect("8.8.8.8:80").await?;
        socket.local_addr()
    };
    match route.await {
        Ok(addr) if addr.ip().is_ipv4() && !addr.ip().is_loopback() => addr.ip().to_string(),
        _ => "localhost".to_string(),
    }
}
