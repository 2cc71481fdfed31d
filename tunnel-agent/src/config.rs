//! Session configuration: the parsed, validated form of the command-line
//! surface, independent of `clap` itself so the rest of the agent can be
//! exercised without going through argument parsing.

use tunnel_protocol::new_client_id;

/// A single forwarding route, registered with the relay under `remote_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelDescriptor {
    pub remote_name: String,
    pub label: String,
    pub local_target: LocalTarget,
    pub strip_host_header: bool,
}

/// The local origin a tunnel forwards to: scheme, host, port, and an
/// optional base path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl LocalTarget {
    /// Parse a target string, prepending `http://` when no scheme is given.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("http://{raw}")
        };

        let url = url_parse(&with_scheme)
            .ok_or_else(|| ConfigError::InvalidLocalTarget(raw.to_string()))?;
        Ok(url)
    }

    /// The scheme + host + port, with no path — what the dispatcher resolves
    /// a request's destination socket from.
    pub fn origin(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}", self.scheme, self.host, port),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }

    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == "https"
    }
}

/// Minimal URL parser covering what forward specs need: `scheme://host[:port][/path]`.
fn url_parse(raw: &str) -> Option<LocalTarget> {
    let (scheme, rest) = raw.split_once("://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), Some(p.parse::<u16>().ok()?)),
        None => (authority.to_string(), None),
    };
    if host.is_empty() {
        return None;
    }
    Some(LocalTarget {
        scheme: scheme.to_string(),
        host,
        port,
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("forward spec {0:?} must look like <name>|<target> or <name>|<label>|<target>")]
    InvalidForwardSpec(String),
    #[error("invalid local target {0:?}")]
    InvalidLocalTarget(String),
    #[error("no valid --forward route was parsed")]
    NoRoutes,
}

/// Parse one `-f/--forward` spec: `<name>|<localTarget>` or
/// `<name>|<label>|<localTarget>`.
pub fn parse_forward_spec(spec: &str) -> Result<TunnelDescriptor, ConfigError> {
    let parts: Vec<&str> = spec.split('|').collect();
    let (remote_name, label, target) = match parts.as_slice() {
        [name, target] => (*name, *name, *target),
        [name, label, target] => (*name, *label, *target),
        _ => return Err(ConfigError::InvalidForwardSpec(spec.to_string())),
    };
    if remote_name.is_empty() || target.is_empty() {
        return Err(ConfigError::InvalidForwardSpec(spec.to_string()));
    }
    Ok(TunnelDescriptor {
        remote_name: remote_name.to_string(),
        label: label.to_string(),
        local_target: LocalTarget::parse(target)?,
        strip_host_header: true,
    })
}

/// The full, validated configuration for one agent session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tunnels: Vec<TunnelDescriptor>,
    pub api_key: String,
    pub hostname: String,
    pub secure: bool,
    pub user_agent: String,
    pub client_id: String,
}

impl SessionConfig {
    pub fn new(
        tunnels: Vec<TunnelDescriptor>,
        api_key: String,
        hostname: String,
        secure: bool,
    ) -> Result<Self, ConfigError> {
        if tunnels.is_empty() {
            return Err(ConfigError::NoRoutes);
        }
        Ok(Self {
            tunnels,
            api_key,
            hostname,
            secure,
            user_agent: format!("tunnel-agent/{}", env!("CARGO_PKG_VERSION")),
            client_id: new_client_id(),
        })
    }

    pub fn tunnel_by_remote_name(&self, name: &str) -> Option<&TunnelDescriptor> {
        self.tunnels.iter().find(|t| t.remote_name == name)
    }

    /// Build the relay URL: `{ws,wss}://<hostname>/api/tunnel?s=<name|label>&...&c=<client_id>`.
    pub fn relay_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut url = format!("{scheme}://{}/api/tunnel?", self.hostname);
        for tunnel in &self.tunnels {
            url.push_str(&format!(
                "s={}%7C{}&",
                urlencode(&tunnel.remote_name),
                urlencode(&tunnel.label)
            ));
        }
        url.push_str(&format!("c={}", urlencode(&self.client_id)));
        url
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_name_and_target() {
        let d = parse_forward_spec("app|http://127.0.0.1:8080").unwrap();
        assert_eq!(d.remote_name, "app");
        assert_eq!(d.label, "app");
        assert_eq!(d.local_target.authority(), "127.0.0.1:8080");
    }

    #[test]
    fn test_parses_name_label_and_target() {
        let d = parse_forward_spec("app|My App|127.0.0.1:8080").unwrap();
        assert_eq!(d.remote_name, "app");
        assert_eq!(d.label, "My App");
        assert_eq!(d.local_target.scheme, "http");
    }

    #[test]
    fn test_prepends_http_scheme_when_missing() {
        let d = parse_forward_spec("app|127.0.0.1:8080").unwrap();
        assert_eq!(d.local_target.origin(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_rejects_malformed_spec() {
        assert!(parse_forward_spec("just-a-name").is_err());
        assert!(parse_forward_spec("a|b|c|d").is_err());
    }

    #[test]
    fn test_local_target_preserves_base_path() {
        let d = parse_forward_spec("app|http://127.0.0.1:8080/base").unwrap();
        assert_eq!(d.local_target.path, "/base");
    }

    #[test]
    fn test_relay_url_repeats_s_param_per_tunnel() {
        let tunnels = vec![
            parse_forward_spec("app|http://127.0.0.1:8080").unwrap(),
            parse_forward_spec("db|db-label|http://127.0.0.1:9000").unwrap(),
        ];
        let cfg = SessionConfig::new(tunnels, "key".into(), "relay.example".into(), true).unwrap();
        let url = cfg.relay_url();
        assert!(url.starts_with("wss://relay.example/api/tunnel?"));
        assert_eq!(url.matches("s=").count(), 2);
        assert!(url.contains("c="));
    }

    #[test]
    fn test_empty_tunnel_list_is_rejected() {
        assert!(SessionConfig::new(vec![], "k".into(), "h".into(), true).is_err());
    }
}
