use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::process::{CommandSupervisor, ProcessHandle, Supervisor};
use crate::scanner::{self, StartupSignals};
use crate::state::{StatusSnapshot, TunnelState, TunnelStatus};
use crate::validate::validate_local_url;

/// トンネルの共通インターフェース
///
/// ライフサイクルは `start()` -> 公開URLを利用 -> `stop()`。
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// プロバイダー名
    fn name(&self) -> &str;

    /// 公開対象のローカルURL
    fn local_url(&self) -> &str;

    /// トンネルを開始して公開URLを返す
    ///
    /// URLが見つかる、起動エラー、タイムアウト、`cancel` のいずれかまで待つ。
    async fn start(&self, cancel: &CancellationToken) -> Result<String>;

    /// トンネルを停止（常に成功し、何度呼んでもよい）
    async fn stop(&self) -> Result<()>;

    fn status(&self) -> TunnelStatus;

    fn status_message(&self) -> String;

    /// 公開URL（未確定なら空文字列）
    fn public_url(&self) -> String;

    fn snapshot(&self) -> StatusSnapshot;
}

/// プロバイダー名からトンネルを作成
pub fn create_tunnel(
    provider: &str,
    local_url: impl Into<String>,
    config: TunnelConfig,
) -> Result<Box<dyn Tunnel>> {
    match provider.to_ascii_lowercase().as_str() {
        "cloudflared" | "cloudflare" | "cf" => {
            debug!("Using cloudflared tunnel provider");
            Ok(Box::new(CloudflaredTunnel::with_config(local_url, config)))
        }
        _ => Err(TunnelError::UnsupportedProvider(provider.to_string())),
    }
}

/// cloudflared のクイックトンネル用引数
pub fn tunnel_args(local_url: &str) -> Vec<String> {
    vec![
        "tunnel".to_string(),
        "--url".to_string(),
        local_url.to_string(),
    ]
}

/// 実行中のプロセスと出力スキャナー
struct Running {
    session: u64,
    process: Box<dyn ProcessHandle>,
    scanner: JoinHandle<()>,
    stop_token: CancellationToken,
    exited: CancellationToken,
}

impl Running {
    async fn shutdown(mut self, grace: Duration) {
        self.stop_token.cancel();
        self.scanner.abort();
        self.process.terminate(grace).await;
    }
}

/// 起動直後の待ち受け対象
struct Launched {
    session: u64,
    stop_token: CancellationToken,
    url_found: oneshot::Receiver<String>,
    startup_error: oneshot::Receiver<String>,
}

/// cloudflared で1つのローカルURLを公開するトンネル
pub struct CloudflaredTunnel {
    local_url: String,
    config: TunnelConfig,
    supervisor: Arc<dyn Supervisor>,
    state: Arc<TunnelState>,
    running: Mutex<Option<Running>>,
}

impl CloudflaredTunnel {
    pub fn new(local_url: impl Into<String>) -> Self {
        Self::with_config(local_url, TunnelConfig::default())
    }

    pub fn with_config(local_url: impl Into<String>, config: TunnelConfig) -> Self {
        Self::with_supervisor(local_url, config, Arc::new(CommandSupervisor))
    }

    pub fn with_supervisor(
        local_url: impl Into<String>,
        config: TunnelConfig,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            local_url: local_url.into(),
            config,
            supervisor,
            state: Arc::new(TunnelState::new()),
            running: Mutex::new(None),
        }
    }

    /// トンネル用バイナリがPATH上にあるか
    pub fn is_binary_installed(&self) -> bool {
        self.supervisor.is_installed(&self.config.binary)
    }

    /// プロセスとスキャナーを起動
    async fn launch(&self) -> Result<Launched> {
        let mut running = self.running.lock().await;
        let still_running = running.as_ref().map(|r| !r.exited.is_cancelled());
        match still_running {
            Some(true) => return Err(TunnelError::AlreadyRunning),
            Some(false) => {
                // 前回のプロセスは既に終了している
                if let Some(r) = running.take() {
                    debug!("Reaping exited tunnel session {}", r.session);
                    r.shutdown(self.config.grace_period()).await;
                }
            }
            None => {}
        }

        let session = self.state.begin_session();
        info!("Starting {} tunnel for {}", self.config.binary, self.local_url);

        let args = tunnel_args(&self.local_url);
        let mut process = match self.supervisor.spawn(&self.config.binary, &args) {
            Ok(process) => process,
            Err(e) => {
                self.state
                    .abort_session(session, &format!("Failed to start tunnel: {}", e));
                return Err(e);
            }
        };

        // cloudflared はURLを stderr に出力する
        let stderr = match process.take_stderr() {
            Some(stderr) => stderr,
            None => {
                process.terminate(self.config.grace_period()).await;
                let e = TunnelError::StderrUnavailable(self.config.binary.clone());
                self.state
                    .abort_session(session, &format!("Failed to start tunnel: {}", e));
                return Err(e);
            }
        };

        let (url_tx, url_found) = oneshot::channel();
        let (error_tx, startup_error) = oneshot::channel();
        let exited = CancellationToken::new();
        let scanner = tokio::spawn(scanner::scan_output(
            stderr,
            self.state.clone(),
            session,
            StartupSignals {
                url_found: Some(url_tx),
                startup_error: Some(error_tx),
                exited: exited.clone(),
            },
        ));

        let stop_token = CancellationToken::new();
        *running = Some(Running {
            session,
            process,
            scanner,
            stop_token: stop_token.clone(),
            exited,
        });

        Ok(Launched {
            session,
            stop_token,
            url_found,
            startup_error,
        })
    }

    /// 起動に失敗したセッションを片付ける
    async fn teardown(&self, session: u64, reason: &TunnelError) {
        let mut running = self.running.lock().await;
        let owned = running
            .as_ref()
            .map_or(false, |r| r.session == session);
        if owned {
            if let Some(r) = running.take() {
                r.shutdown(self.config.grace_period()).await;
            }
        }
        self.state
            .abort_session(session, &format!("Tunnel failed: {}", reason));
    }
}

#[async_trait]
impl Tunnel for CloudflaredTunnel {
    fn name(&self) -> &str {
        "cloudflared"
    }

    fn local_url(&self) -> &str {
        &self.local_url
    }

    async fn start(&self, cancel: &CancellationToken) -> Result<String> {
        validate_local_url(&self.local_url)?;
        if cancel.is_cancelled() {
            return Err(TunnelError::Cancelled);
        }

        let Launched {
            session,
            stop_token,
            url_found,
            startup_error,
        } = self.launch().await?;

        let wait = self.config.startup_timeout();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            // stop() が後始末を済ませている
            _ = stop_token.cancelled() => return Err(TunnelError::Stopped),
            Ok(url) = url_found => Ok(url),
            Ok(reason) = startup_error => Err(TunnelError::Startup(reason)),
            _ = tokio::time::sleep(wait) => Err(TunnelError::Timeout(wait)),
        };

        match outcome {
            Ok(url) => {
                info!("Tunnel for {} available at {}", self.local_url, url);
                Ok(url)
            }
            Err(e) => {
                warn!("Tunnel startup failed: {}", e);
                self.teardown(session, &e).await;
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.take() {
            info!("Stopping tunnel for {}", self.local_url);
            r.shutdown(self.config.grace_period()).await;
        }
        self.state.stopped();
        Ok(())
    }

    fn status(&self) -> TunnelStatus {
        self.state.status()
    }

    fn status_message(&self) -> String {
        self.state.status_message()
    }

    fn public_url(&self) -> String {
        self.state.public_url()
    }

    fn snapshot(&self) -> StatusSnapshot {
        self.state.snapshot()
    }
}

impl Drop for CloudflaredTunnel {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().as_mut() {
            warn!("Tunnel dropped while still running, killing {}", self.config.binary);
            running.scanner.abort();
            running.process.start_kill();
        }
    }
}
