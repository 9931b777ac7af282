use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, TunnelError};

pub const CLOUDFLARED: &str = "cloudflared";

/// サブプロセスの診断出力ストリーム
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// 起動済みプロセスへのハンドル
#[async_trait]
pub trait ProcessHandle: Send {
    /// プロセスID（終了済みなら `None`）
    fn id(&self) -> Option<u32>;

    /// 診断出力（stderr）を取り出す。2回目以降は `None`
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// 終了を要求し、猶予期間を過ぎたら強制終了する
    ///
    /// 何度呼んでもよい。
    async fn terminate(&mut self, grace: Duration);

    /// 待たずに強制終了を開始（Drop用）
    fn start_kill(&mut self);
}

/// 外部バイナリの起動
pub trait Supervisor: Send + Sync {
    fn spawn(&self, binary: &str, args: &[String]) -> Result<Box<dyn ProcessHandle>>;

    fn is_installed(&self, binary: &str) -> bool {
        is_binary_installed(binary)
    }
}

/// PATH上のバイナリを探す
pub fn find_binary(binary: &str) -> Option<PathBuf> {
    which::which(binary).ok()
}

pub fn is_binary_installed(binary: &str) -> bool {
    find_binary(binary).is_some()
}

pub fn is_cloudflared_installed() -> bool {
    is_binary_installed(CLOUDFLARED)
}

/// `tokio::process` による実プロセスの起動
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSupervisor;

impl Supervisor for CommandSupervisor {
    fn spawn(&self, binary: &str, args: &[String]) -> Result<Box<dyn ProcessHandle>> {
        let path = find_binary(binary).ok_or_else(|| TunnelError::BinaryNotFound {
            binary: binary.to_string(),
        })?;

        debug!("Spawning {} {:?}", path.display(), args);

        let mut child = Command::new(&path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                binary: binary.to_string(),
                source,
            })?;

        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream);

        info!("Started {} (pid {:?})", binary, child.id());

        Ok(Box::new(ChildProcess {
            name: binary.to_string(),
            child,
            stderr,
        }))
    }
}

/// pid にSIGTERMを送る
#[cfg(unix)]
fn send_sigterm(pid: u32) -> bool {
    // SAFETY: libc::kill はメモリに触れない。pid は Child::id() が返した未回収の子プロセス
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

/// 実プロセス
struct ChildProcess {
    name: String,
    child: Child,
    stderr: Option<OutputStream>,
}

impl ChildProcess {
    /// SIGTERMを送る。送れなかった場合は `false`
    #[cfg(unix)]
    fn interrupt(&self) -> bool {
        self.child.id().map_or(false, send_sigterm)
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> bool {
        false
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_stderr(&mut self) -> Option<OutputStream> {
        self.stderr.take()
    }

    async fn terminate(&mut self, grace: Duration) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("{} already exited: {}", self.name, status);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to poll {}: {}", self.name, e),
        }

        if self.interrupt() {
            match timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => {
                    info!("{} exited: {}", self.name, status);
                    return;
                }
                Ok(Err(e)) => warn!("Error waiting for {}: {}", self.name, e),
                Err(_) => warn!(
                    "{} did not exit within {:?}, killing it",
                    self.name, grace
                ),
            }
        }

        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill {}: {}", self.name, e);
        }
    }

    fn start_kill(&mut self) {
        let _ = self.child.start_kill();
    }
}
