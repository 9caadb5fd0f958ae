use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use restream::EngineConfig;

/// Republish live DASH channels as plain HTTP byte streams.
#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct Args {
    /// Address to listen on
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[clap(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// M3U playlist with the channels to serve
    #[clap(long, env = "M3U_PATH", default_value = "/data/playlist.m3u")]
    pub m3u_path: PathBuf,

    /// Upper bound of the video bandwidth, overrides the config file
    #[clap(long, env = "VIDEO_BW")]
    pub video_bw: Option<u64>,

    /// Start every channel after loading the playlist
    #[clap(long, env = "AUTOSTART", default_value = "true", action = clap::ArgAction::Set)]
    pub autostart: bool,

    /// Use the specified HTTP/HTTPS/SOCKS5 proxy for upstream requests
    #[clap(long, env = "HTTP_PROXY")]
    pub proxy: Option<String>,

    /// TOML file with engine tuning
    #[clap(long, env = "RESTREAM_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Engine configuration from the config file, with command line overrides applied.
    pub fn engine(&self) -> anyhow::Result<EngineConfig> {
        let mut engine = match &self.config {
            Some(path) => {
                let data = std::fs::read_to_string(path)?;
                toml::from_str(&data)?
            }
            None => EngineConfig::default(),
        };
        if let Some(bandwidth) = self.video_bw {
            engine.video_bandwidth = bandwidth;
        }
        Ok(engine)
    }
}
