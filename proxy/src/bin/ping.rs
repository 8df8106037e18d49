use clap::Parser;
use proxy::utils::get_timestamp;
use protocol::raknet::{UnconnectedPing, UnconnectedPong};
use protocol::Packet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Queries a RakNet server (or the proxy) the way the server list does.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server to ping
        #[clap(short, long, default_value = "127.0.0.1:19132")]
        target: SocketAddr,
        /// How long to wait for each pong
        #[clap(long, default_value = "1000")]
        timeout_ms: u64,
        /// Number of pings to send
        #[clap(short, long, default_value = "1")]
        count: u32,
    }

    let args = Args::parse();
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let mut buf = [0u8; 2048];

    for _ in 0..args.count {
        let ping = UnconnectedPing {
            ping_id: get_timestamp(),
        };
        let sent_at = Instant::now();
        socket.send_to(&ping.encode(), args.target).await?;

        match timeout(Duration::from_millis(args.timeout_ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, addr))) => match UnconnectedPong::decode(&buf[..len]) {
                Ok(pong) if pong.ping_id == ping.ping_id => {
                    println!(
                        "{} answered in {} ms: {} (guid {})",
                        addr,
                        sent_at.elapsed().as_millis(),
                        pong.name,
                        pong.server_guid
                    );
                }
                Ok(_) => println!("{} answered a different ping", addr),
                Err(e) => println!("{} sent an invalid pong: {}", addr, e),
            },
            Ok(Err(e)) => println!("Receive failed: {}", e),
            Err(_) => println!("No answer from {} within {} ms", args.target, args.timeout_ms),
        }
    }

    Ok(())
}
