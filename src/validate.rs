use url::Url;

use crate::error::ValidationError;

const ALLOWED_HOSTS: [&str; 2] = ["localhost", "127.0.0.1"];

/// ローカルURLを検証
///
/// トンネルはループバック上のHTTP/HTTPSサービスだけを公開する。
/// 外部ホストを指すURLは、プロセスを起動する前にここで拒否される。
pub fn validate_local_url(candidate: &str) -> Result<(), ValidationError> {
    let url = Url::parse(candidate).map_err(|e| match e {
        url::ParseError::InvalidPort => ValidationError::InvalidPort(raw_port(candidate)),
        _ => ValidationError::Unparsable(candidate.to_string()),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ValidationError::InvalidScheme(other.to_string())),
    }

    // urlクレートは "127.1" や既定ポートを正規化するので、元の文字列とも突き合わせる
    let authority = raw_authority(candidate);
    if !url.username().is_empty() || url.password().is_some() || authority.contains('@') {
        return Err(ValidationError::EmbeddedCredentials);
    }

    let host = url.host_str().unwrap_or("");
    if !ALLOWED_HOSTS.contains(&host) {
        return Err(ValidationError::InvalidHost(host.to_string()));
    }
    let (raw_host, port) = split_port(authority);
    if raw_host != host {
        return Err(ValidationError::InvalidHost(raw_host.to_string()));
    }

    match port {
        None | Some("") => Err(ValidationError::MissingPort),
        Some(p) => match p.parse::<u32>() {
            Ok(n) if (1..=65535).contains(&n)
                && url.port_or_known_default() == Some(n as u16) =>
            {
                Ok(())
            }
            _ => Err(ValidationError::InvalidPort(p.to_string())),
        },
    }
}

/// "scheme://authority/..." から authority 部分を取り出す
///
/// `\` は http(s) ではパス区切りとして扱われるので、ここでも区切りとみなす。
fn raw_authority(candidate: &str) -> &str {
    let rest = candidate
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(candidate);
    let end = rest
        .find(|c: char| matches!(c, '/' | '?' | '#' | '\\'))
        .unwrap_or(rest.len());
    &rest[..end]
}

fn split_port(authority: &str) -> (&str, Option<&str>) {
    match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    }
}

fn raw_port(candidate: &str) -> String {
    let authority = raw_authority(candidate);
    let authority = authority
        .rsplit_once('@')
        .map(|(_, host)| host)
        .unwrap_or(authority);
    split_port(authority).1.unwrap_or("").to_string()
}
