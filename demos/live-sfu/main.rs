// Live broadcast SFU server
//
// Runs the signaling server on top of mediasoup workers, with the FFmpeg HLS
// bridge and a Redis or in-memory presence store.

use std::{net::IpAddr, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use live_sfu::{
    engine::{IceServer, MediasoupEngine},
    init_logging,
    presence::{redis::RedisPresenceStore, MemoryPresenceStore, PresenceStore},
    sfu::{Sfu, SfuConfig},
    transcode::FfmpegTranscoder,
};

/// Live broadcast SFU server
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Listen address of the signaling server
    #[clap(short, long, env = "SFU_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    listen_addr: SocketAddr,

    /// Number of media workers (defaults to one per core)
    #[clap(short, long, env = "SFU_WORKERS")]
    workers: Option<usize>,

    /// First RTC port
    #[clap(long, env = "SFU_RTC_MIN_PORT", default_value = "10000")]
    rtc_min_port: u16,

    /// RTC ports per worker
    #[clap(long, env = "SFU_PORTS_PER_WORKER", default_value = "100")]
    ports_per_worker: u16,

    /// Address advertised in ICE candidates
    #[clap(long, env = "SFU_ANNOUNCED_IP", default_value = "127.0.0.1")]
    announced_ip: IpAddr,

    /// STUN/TURN urls handed to clients
    #[clap(long = "ice-server", env = "SFU_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// Initial outgoing bitrate of transports (bps)
    #[clap(long, env = "SFU_INITIAL_BITRATE", default_value = "1000000")]
    initial_bitrate: u32,

    /// Maximum connections per room
    #[clap(long, env = "SFU_ROOM_CAPACITY", default_value = "100")]
    room_capacity: usize,

    /// Deadline of engine requests (seconds)
    #[clap(long, env = "SFU_ENGINE_TIMEOUT", default_value = "10")]
    engine_timeout: u64,

    /// Directory HLS output is written to
    #[clap(long, env = "SFU_HLS_DIR", default_value = "./hls_output")]
    hls_dir: PathBuf,

    /// Public base URL of the HLS directory
    #[clap(long, env = "SFU_HLS_BASE_URL", default_value = "http://127.0.0.1:8080/hls")]
    hls_base_url: String,

    /// FFmpeg binary
    #[clap(long, env = "SFU_FFMPEG", default_value = "ffmpeg")]
    ffmpeg: PathBuf,

    /// Redis presence store (in-memory when absent)
    #[clap(long, env = "SFU_REDIS_URL")]
    redis_url: Option<String>,
}

impl Args {
    fn into_config(self) -> SfuConfig {
        let mut config = SfuConfig {
            bind_addr: self.listen_addr,
            engine_timeout: Duration::from_secs(self.engine_timeout),
            max_room_capacity: self.room_capacity,
            ..SfuConfig::default()
        };
        if let Some(workers) = self.workers {
            config.workers.num_workers = workers.max(1);
        }
        config.workers.rtc_min_port = self.rtc_min_port;
        config.workers.ports_per_worker = self.ports_per_worker;
        config.transport.announced_ip = Some(self.announced_ip);
        config.transport.initial_available_outgoing_bitrate = self.initial_bitrate;
        config.transport.ice_servers = self
            .ice_servers
            .into_iter()
            .map(|url| IceServer {
                urls: vec![url],
                username: None,
                credential: None,
            })
            .collect();
        config.transcode.output_dir = self.hls_dir;
        config.transcode.hls_base_url = self.hls_base_url;
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    // Parse command line arguments
    let args = Args::parse();

    let presence: Arc<dyn PresenceStore> = match &args.redis_url {
        Some(url) => Arc::new(RedisPresenceStore::connect(url).await?),
        None => {
            tracing::warn!("No Redis URL given, viewer counts stay local to this process");
            Arc::new(MemoryPresenceStore::new())
        }
    };
    let transcoder = Arc::new(FfmpegTranscoder::new(args.ffmpeg.clone()));
    let config = args.into_config();

    // Create SFU
    let sfu = Sfu::new(Arc::new(MediasoupEngine::new()), transcoder, presence, config).await?;

    // Start SFU
    let addr = sfu.start().await?;
    println!("SFU signaling listening on ws://{}/live/streaming", addr);
    println!("Press Ctrl+C to stop");

    // Wait for Ctrl+C
    tokio::signal::ctrl_c().await?;

    // Stop SFU
    sfu.shutdown().await;

    println!("SFU server stopped");

    Ok(())
}
