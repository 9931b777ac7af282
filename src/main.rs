use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cftunnel::{
    create_tunnel, CancellationToken, StatusSnapshot, Tunnel, TunnelConfig, TunnelStatus,
};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[clap(name = "cftunnel")]
#[clap(about = "Expose a local HTTP server through a temporary public URL", long_about = None)]
struct Cli {
    /// 設定ファイル (TOML)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// ローカルURLをトンネルで公開
    Expose {
        /// 公開するローカルURL (例: http://localhost:3000)
        local_url: String,

        /// トンネルプロバイダー
        #[clap(short, long, default_value = "cloudflared")]
        provider: String,

        /// 状態をJSONで出力
        #[clap(long)]
        json: bool,
    },

    /// トンネル用バイナリがインストールされているか確認
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TunnelConfig::from_file(path)?,
        None => TunnelConfig::default(),
    };

    match cli.command {
        Commands::Expose {
            local_url,
            provider,
            json,
        } => expose(&provider, local_url, config, json).await,
        Commands::Check => {
            match cftunnel::find_binary(&config.binary) {
                Some(path) => println!("{} found at {}", config.binary, path.display()),
                None => {
                    anyhow::bail!(cftunnel::TunnelError::BinaryNotFound {
                        binary: config.binary
                    })
                }
            }
            Ok(())
        }
    }
}

async fn expose(provider: &str, local_url: String, config: TunnelConfig, json: bool) -> Result<()> {
    let binary = config.binary.clone();
    let tunnel = create_tunnel(provider, local_url, config)?;
    if !cftunnel::is_binary_installed(&binary) {
        anyhow::bail!(cftunnel::TunnelError::BinaryNotFound { binary });
    }

    // Ctrl+Cハンドラー
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c signal: {:?}", e);
                return;
            }
            shutdown.cancel();
        });
    }

    info!("Starting tunnel for {}", tunnel.local_url());
    let public_url = tunnel
        .start(&shutdown)
        .await
        .with_context(|| format!("Failed to expose {}", tunnel.local_url()))?;

    if json {
        print_json(&tunnel.snapshot())?;
    } else {
        println!("Tunnel established! Public URL: {}", public_url);
        println!("Press Ctrl+C to stop...");
    }

    // 状態の変化を表示しながら待機
    let mut last = tunnel.snapshot();
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let current = tunnel.snapshot();
                if current != last {
                    report(&current, json)?;
                    last = current;
                }
                if last.status == TunnelStatus::Disconnected {
                    warn!("Tunnel is no longer running: {}", last.message);
                    break;
                }
            }
        }
    }

    println!("Shutting down...");
    tunnel.stop().await?;
    if json {
        print_json(&tunnel.snapshot())?;
    }
    Ok(())
}

fn report(snapshot: &StatusSnapshot, json: bool) -> Result<()> {
    if json {
        print_json(snapshot)
    } else {
        info!("Tunnel {}: {}", snapshot.status, snapshot.message);
        Ok(())
    }
}

fn print_json(snapshot: &StatusSnapshot) -> Result<()> {
    let s = serde_json::to_string(snapshot).context("Failed to serialize tunnel status")?;
    println!("{}", s);
    Ok(())
}
