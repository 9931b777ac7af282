// cloudflared のクイックトンネルでローカルHTTPサーバーを一時的に公開する
// 外部バイナリを起動・監視し、stderrから公開URLと接続状態を読み取る

mod config;
mod error;
mod process;
mod scanner;
mod state;
mod tunnel;
mod validate;

// パブリックAPI
pub use config::TunnelConfig;
pub use error::{Result, TunnelError, ValidationError};
pub use process::{
    find_binary, is_binary_installed, is_cloudflared_installed, CommandSupervisor, OutputStream,
    ProcessHandle, Supervisor, CLOUDFLARED,
};
pub use scanner::{extract_public_url, is_connection_registered, is_reconnecting};
pub use state::{StatusSnapshot, TunnelStatus};
pub use tunnel::{create_tunnel, tunnel_args, CloudflaredTunnel, Tunnel};
pub use validate::validate_local_url;

pub use tokio_util::sync::CancellationToken;
