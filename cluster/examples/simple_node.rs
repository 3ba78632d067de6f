use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use cluster::channel::channel_listener::ChannelListener;
use cluster::channel::replication_channel::ReplicationChannel;
use cluster::cluster_config::ClusterConfig;
use tokio::{select, signal, time};
use tracing::{error, info, Level};
use transport::channel_message::{ChannelMessage, SendOptions};
use transport::member::Member;

/// Sends a numbered message to all peers once per second, and logs the messages it receives.
#[derive(Parser)]
struct Args {
    bind_address: String,

    #[clap(long)]
    peer: Vec<String>,

    /// wait for the peers to process each message
    #[clap(long, default_value_t = false)]
    sync_ack: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

struct LoggingListener;

#[async_trait]
impl ChannelListener for LoggingListener {
    async fn message_received(&self, msg: &ChannelMessage) -> anyhow::Result<()> {
        info!("received {:?} from {:?}: {}", msg.unique_id, msg.address, String::from_utf8_lossy(&msg.payload));
        Ok(())
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.peer.is_empty() {
        return Err(anyhow!("missing peers"));
    }

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut peers = Vec::new();
    for s in args.peer {
        let addr: SocketAddr = s.parse()?;
        // peers are keyed by address only here, their unique part is not known up front
        peers.push(Member::new(0, addr));
    }

    let config = ClusterConfig::new(args.bind_address.parse()?)?;
    let channel = Arc::new(ReplicationChannel::new(Arc::new(config)).await?);
    channel.add_listener(Arc::new(LoggingListener));
    for &peer in &peers {
        channel.member_added(peer);
    }
    channel.start();

    let options = if args.sync_ack { SendOptions::sync_ack() } else { SendOptions::async_ack() };

    select! {
        _ = send_loop(channel.clone(), peers, options) => {}
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    channel.stop().await;
    Ok(())
}

async fn send_loop(channel: Arc<ReplicationChannel>, peers: Vec<Member>, options: SendOptions) {
    let mut ticks = time::interval(Duration::from_secs(1));
    let mut counter = 0u64;
    loop {
        ticks.tick().await;
        counter += 1;

        let payload = format!("message #{} from {}", counter, channel.local_member());
        match channel.send(&peers, payload.into_bytes(), options).await {
            Ok(id) => info!("sent {:?}", id),
            Err(e) => error!("{}", e),
        }
    }
}
