//! Upstream target selection.

/// How a session picks its upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPolicy {
    /// Always dial this `host:port`.
    Explicit(String),
    /// Dial the negotiated server name on the port we are listening on.
    ///
    /// Reusing the listen port assumes the interception port matches the
    /// real service port, which holds for transparent redirects but not in
    /// general.
    Mirror { port: u16 },
}

impl TargetPolicy {
    /// Explicit target wins whenever one is configured.
    pub fn new(explicit: Option<String>, listen_port: u16) -> Self {
        match explicit {
            Some(target) => Self::Explicit(target),
            None => Self::Mirror { port: listen_port },
        }
    }

    /// The upstream address for a session whose effective server name
    /// (SNI, or the fallback when the client sent none) is `server_name`.
    pub fn resolve(&self, server_name: &str) -> String {
        match self {
            Self::Explicit(target) => target.clone(),
            Self::Mirror { port } => format!("{}:{}", server_name, port),
        }
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}
