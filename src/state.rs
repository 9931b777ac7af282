use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tracing::debug;

pub const STARTING_MESSAGE: &str = "Starting tunnel...";
pub const STOPPED_MESSAGE: &str = "Tunnel stopped";
pub const EXITED_MESSAGE: &str = "Tunnel process exited";

/// トンネルの接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Disconnected,
    Starting,
    Connected,
    Reconnecting,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// 状態・メッセージ・公開URLのスナップショット（一度のロックで取得）
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatusSnapshot {
    pub status: TunnelStatus,
    pub message: String,
    pub public_url: String,
}

#[derive(Debug, Default)]
struct Inner {
    session: u64,
    snapshot: StatusSnapshot,
}

/// トンネル状態マシン
///
/// 変更はすべて単一のロック内で行われ、フィールドの組が中途半端に見えることはない。
/// `session` はStart毎に増え、古いスキャナーからの書き込みを無視するために使う。
#[derive(Debug, Default)]
pub struct TunnelState {
    inner: Mutex<Inner>,
}

impl TunnelState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> TunnelStatus {
        self.lock().snapshot.status
    }

    pub fn status_message(&self) -> String {
        self.lock().snapshot.message.clone()
    }

    pub fn public_url(&self) -> String {
        self.lock().snapshot.public_url.clone()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().snapshot.clone()
    }

    /// 新しいセッションを開始して Starting に遷移
    pub fn begin_session(&self) -> u64 {
        let mut inner = self.lock();
        inner.session += 1;
        inner.snapshot = StatusSnapshot {
            status: TunnelStatus::Starting,
            message: STARTING_MESSAGE.to_string(),
            public_url: String::new(),
        };
        debug!("Tunnel session {} starting", inner.session);
        inner.session
    }

    /// 公開URLを記録して Connected に遷移（セッション内で一度だけ）
    ///
    /// 記録された場合のみ `true` を返す。
    pub fn publish_url(&self, session: u64, url: &str) -> bool {
        let mut inner = self.lock();
        if !inner.is_live(session) || !inner.snapshot.public_url.is_empty() {
            return false;
        }
        inner.snapshot = StatusSnapshot {
            status: TunnelStatus::Connected,
            message: format!("Tunnel established at {}", url),
            public_url: url.to_string(),
        };
        true
    }

    /// エッジへの接続登録を反映
    pub fn mark_connected(&self, session: u64, message: &str) {
        self.transition(session, TunnelStatus::Connected, message);
    }

    /// 再接続中を反映
    pub fn mark_reconnecting(&self, session: u64, message: &str) {
        self.transition(session, TunnelStatus::Reconnecting, message);
    }

    // URLが未確定のうちはメッセージのみ更新する
    fn transition(&self, session: u64, status: TunnelStatus, message: &str) {
        let mut inner = self.lock();
        if !inner.is_live(session) {
            return;
        }
        if !inner.snapshot.public_url.is_empty() {
            inner.snapshot.status = status;
        }
        inner.snapshot.message = message.to_string();
    }

    /// 起動に失敗したセッションを Disconnected に戻す
    pub fn abort_session(&self, session: u64, message: &str) {
        let mut inner = self.lock();
        if !inner.is_live(session) {
            return;
        }
        inner.snapshot = StatusSnapshot {
            status: TunnelStatus::Disconnected,
            message: message.to_string(),
            public_url: String::new(),
        };
    }

    /// 公開後にプロセスが終了した
    pub fn process_exited(&self, session: u64) {
        self.abort_session(session, EXITED_MESSAGE);
    }

    /// 停止状態にリセット（何度呼んでもよい）
    pub fn stopped(&self) {
        let mut inner = self.lock();
        inner.snapshot = StatusSnapshot {
            status: TunnelStatus::Disconnected,
            message: STOPPED_MESSAGE.to_string(),
            public_url: String::new(),
        };
    }
}

impl Inner {
    fn is_live(&self, session: u64) -> bool {
        self.session == session && self.snapshot.status != TunnelStatus::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let state = TunnelState::new();
        assert_eq!(state.status(), TunnelStatus::Disconnected);
        assert_eq!(state.status_message(), "");
        assert_eq!(state.public_url(), "");
    }

    #[test]
    fn test_publish_url_is_write_once() {
        let state = TunnelState::new();
        let session = state.begin_session();
        assert_eq!(state.status(), TunnelStatus::Starting);
        assert_eq!(state.status_message(), STARTING_MESSAGE);

        assert!(state.publish_url(session, "https://first.trycloudflare.com"));
        assert!(!state.publish_url(session, "https://second.trycloudflare.com"));

        let snap = state.snapshot();
        assert_eq!(snap.status, TunnelStatus::Connected);
        assert_eq!(snap.public_url, "https://first.trycloudflare.com");
    }

    #[test]
    fn test_process_exited_after_publish() {
        let state = TunnelState::new();
        let session = state.begin_session();
        state.publish_url(session, "https://exit.trycloudflare.com");
        state.process_exited(session);

        let snap = state.snapshot();
        assert_eq!(snap.status, TunnelStatus::Disconnected);
        assert_eq!(snap.message, EXITED_MESSAGE);
        assert_eq!(snap.public_url, "");

        // 停止済みなら上書きしない
        let session = state.begin_session();
        state.stopped();
        state.process_exited(session);
        assert_eq!(state.status_message(), STOPPED_MESSAGE);
    }

    #[test]
    fn test_keyword_before_url_keeps_starting() {
        let state = TunnelState::new();
        let session = state.begin_session();
        state.mark_connected(session, "Registered tunnel connection");
        assert_eq!(state.status(), TunnelStatus::Starting);
        assert_eq!(state.status_message(), "Registered tunnel connection");
        assert_eq!(state.public_url(), "");
    }

    #[test]
    fn test_reconnect_cycle() {
        let state = TunnelState::new();
        let session = state.begin_session();
        state.publish_url(session, "https://a.trycloudflare.com");

        state.mark_reconnecting(session, "Reconnecting");
        assert_eq!(state.status(), TunnelStatus::Reconnecting);
        state.mark_connected(session, "Connected");
        assert_eq!(state.status(), TunnelStatus::Connected);
        assert_eq!(state.public_url(), "https://a.trycloudflare.com");
    }

    #[test]
    fn test_stopped_is_idempotent() {
        let state = TunnelState::new();
        for _ in 0..3 {
            state.stopped();
            assert_eq!(state.status(), TunnelStatus::Disconnected);
            assert_eq!(state.status_message(), STOPPED_MESSAGE);
            assert_eq!(state.public_url(), "");
        }
    }

    #[test]
    fn test_stale_session_is_ignored() {
        let state = TunnelState::new();
        let old = state.begin_session();
        state.stopped();

        assert!(!state.publish_url(old, "https://stale.trycloudflare.com"));
        state.mark_reconnecting(old, "stale");
        assert_eq!(state.status(), TunnelStatus::Disconnected);
        assert_eq!(state.status_message(), STOPPED_MESSAGE);

        let new = state.begin_session();
        assert_ne!(old, new);
        assert!(!state.publish_url(old, "https://stale.trycloudflare.com"));
        assert!(state.publish_url(new, "https://fresh.trycloudflare.com"));
        assert_eq!(state.public_url(), "https://fresh.trycloudflare.com");
    }

    #[test]
    fn test_abort_session_resets() {
        let state = TunnelState::new();
        let session = state.begin_session();
        state.abort_session(session, "Failed to start tunnel: boom");
        assert_eq!(state.status(), TunnelStatus::Disconnected);
        assert_eq!(state.status_message(), "Failed to start tunnel: boom");
    }

    #[test]
    fn test_status_display_and_json() {
        assert_eq!(TunnelStatus::Reconnecting.to_string(), "reconnecting");
        let snap = StatusSnapshot {
            status: TunnelStatus::Connected,
            message: "ok".into(),
            public_url: "https://a.trycloudflare.com".into(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "connected");
        assert_eq!(json["public_url"], "https://a.trycloudflare.com");
    }

    #[test]
    fn test_concurrent_readers_see_consistent_triple() {
        let state = Arc::new(TunnelState::new());
        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let session = state.begin_session();
                    state.publish_url(session, &format!("https://s{}.trycloudflare.com", i));
                    state.mark_reconnecting(session, "Reconnecting");
                    state.stopped();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let snap = state.snapshot();
                        match snap.status {
                            TunnelStatus::Connected | TunnelStatus::Reconnecting => {
                                assert!(!snap.public_url.is_empty())
                            }
                            _ => assert!(snap.public_url.is_empty()),
                        }
                        let _ = state.status();
                        let _ = state.status_message();
                        let _ = state.public_url();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
