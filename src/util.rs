//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/certs/ca.crt"` → `"/home/user/certs/ca.crt"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Split `host[:port]` (or `[v6]:port`) into its parts.
///
/// - `"node-a:10250"` → `("node-a", Some(10250))`
/// - `"node-a"` → `("node-a", None)`
/// - `"[::1]:80"` → `("::1", Some(80))`
pub fn split_host_port(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, port.parse().ok()),
        _ => (authority, None),
    }
}

/// Percent-encode a query component (RFC 3986 unreserved characters pass).
pub fn query_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("node-a:10250"), ("node-a", Some(10250)));
        assert_eq!(split_host_port("node-a"), ("node-a", None));
        assert_eq!(split_host_port("[::1]:80"), ("::1", Some(80)));
        assert_eq!(split_host_port("fe80::1"), ("fe80::1", None));
    }

    #[test]
    fn test_query_escape() {
        assert_eq!(query_escape("cam-1"), "cam-1");
        assert_eq!(query_escape("rtsp://10.0.0.9/live"), "rtsp%3A%2F%2F10.0.0.9%2Flive");
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/etc/edgestream/ca.crt"), "/etc/edgestream/ca.crt");
    }
}
