use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::TunnelState;

lazy_static! {
    static ref PUBLIC_URL: Regex =
        Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").unwrap();
    static ref CONNECTION_REGISTERED: Regex =
        Regex::new(r"(?i)registered tunnel connection|connection \S+ registered").unwrap();
    static ref RECONNECTING: Regex = Regex::new(r"(?i)retrying|reconnect").unwrap();
}

/// 1行から公開URLを取り出す
pub fn extract_public_url(line: &str) -> Option<&str> {
    PUBLIC_URL.find(line).map(|m| m.as_str())
}

/// エッジへの接続が確立した行か
pub fn is_connection_registered(line: &str) -> bool {
    CONNECTION_REGISTERED.is_match(line)
}

/// 再接続を示す行か
pub fn is_reconnecting(line: &str) -> bool {
    RECONNECTING.is_match(line)
}

/// 1行として扱う最大バイト数（超えた分は次の改行まで捨てる）
const MAX_LINE_BYTES: usize = 64 * 1024;

/// スキャナーからコントローラーへの通知
pub(crate) struct StartupSignals {
    /// 公開URL（一度きり）
    pub url_found: Option<oneshot::Sender<String>>,
    /// 起動エラー（一度きり）
    pub startup_error: Option<oneshot::Sender<String>>,
    /// 出力が閉じた（プロセス終了）
    pub exited: CancellationToken,
}

/// サブプロセスの診断出力を読み続け、状態を更新
///
/// EOFまたはタスクの中断で終了する。読めない行や関係ない行は無視する。
pub(crate) async fn scan_output<R>(
    reader: R,
    state: Arc<TunnelState>,
    session: u64,
    mut signals: StartupSignals,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut discarding = false;

    loop {
        buf.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64)
            .read_until(b'\n', &mut buf)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to read tunnel output: {}", e);
                signal_error(&mut signals, format!("failed to read tunnel output: {}", e));
                break;
            }
        }

        let complete = buf.last() == Some(&b'\n');
        if discarding {
            discarding = !complete;
            continue;
        }
        if !complete && buf.len() >= MAX_LINE_BYTES {
            debug!("Tunnel output line exceeds {} bytes, truncating", MAX_LINE_BYTES);
            discarding = true;
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        debug!(target: "cftunnel::cloudflared", "{}", line);
        scan_line(line, &state, session, &mut signals);
    }

    // 状態より先に通知し、Disconnected が見えた時点で再起動できるようにする
    signals.exited.cancel();
    if signals.url_found.is_some() {
        signal_error(
            &mut signals,
            "tunnel process exited without providing a public URL".to_string(),
        );
    } else {
        warn!("Tunnel process output closed");
        state.process_exited(session);
    }
}

fn scan_line(line: &str, state: &TunnelState, session: u64, signals: &mut StartupSignals) {
    if let Some(url) = extract_public_url(line) {
        // 状態を書いてから通知する
        if state.publish_url(session, url) {
            info!("Tunnel URL discovered: {}", url);
            if let Some(tx) = signals.url_found.take() {
                let _ = tx.send(url.to_string());
            }
        }
    }

    if is_connection_registered(line) {
        state.mark_connected(session, "Connected to Cloudflare edge");
    }

    if is_reconnecting(line) {
        warn!("Tunnel reconnecting: {}", line);
        state.mark_reconnecting(session, "Reconnecting to Cloudflare edge");
    }
}

fn signal_error(signals: &mut StartupSignals, message: String) {
    if let Some(tx) = signals.startup_error.take() {
        let _ = tx.send(message);
    }
}
