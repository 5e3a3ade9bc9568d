//! Endpoint data models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported proxy protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Socks4,
    Socks5,
    Http,
    Https,
}

impl Protocol {
    /// All supported protocols, in probe order
    pub fn all() -> [Protocol; 4] {
        [
            Protocol::Socks4,
            Protocol::Socks5,
            Protocol::Http,
            Protocol::Https,
        ]
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Socks4 => write!(f, "socks4"),
            Protocol::Socks5 => write!(f, "socks5"),
            Protocol::Http => write!(f, "http"),
            Protocol::Https => write!(f, "https"),
        }
    }
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "socks4" => Ok(Protocol::Socks4),
            // socks5h only changes where DNS happens, the wire handshake is the same
            "socks5" | "socks5h" => Ok(Protocol::Socks5),
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            _ => Err(anyhow::anyhow!(
                "Invalid protocol: {}. Use: socks4, socks5, http, https",
                s
            )),
        }
    }
}

/// Verdict of the last full check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Status {
    Alive,
    Dead,
}

/// A proxy candidate identified by ip, port and optional credentials.
///
/// The (ip, port, username, password) tuple is unique; empty credential
/// strings mean "no auth". Protocol flags and `status` are written only by
/// the endpoint checker after a check completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    pub id: i64,
    pub ip: String,
    pub port: u16,

    pub username: String,
    pub password: String,

    pub added_at: chrono::DateTime<chrono::Utc>,
    pub last_check_at: Option<chrono::DateTime<chrono::Utc>>,

    pub status: Option<Status>,

    pub socks4: bool,
    pub socks5: bool,
    pub http: bool,
    pub https: bool,

    /// Minimum latency observed across working protocols, in milliseconds
    pub latency: Option<f64>,
}

impl Endpoint {
    /// Create a fresh, unchecked endpoint
    pub fn new(ip: String, port: u16, username: String, password: String) -> Self {
        Self {
            id: 0,
            ip,
            port,
            username,
            password,
            added_at: chrono::Utc::now(),
            last_check_at: None,
            status: None,
            socks4: false,
            socks5: false,
            http: false,
            https: false,
            latency: None,
        }
    }

    /// `user:pass@` prefix, or empty when the endpoint has no credentials
    pub fn credentials(&self) -> String {
        if self.username.is_empty() {
            String::new()
        } else {
            format!("{}:{}@", self.username, self.password)
        }
    }

    /// `ip:port`
    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `[user:pass@]ip:port`
    pub fn credentials_ip_port(&self) -> String {
        format!("{}{}", self.credentials(), self.ip_port())
    }

    /// Best confirmed protocol: socks5 > socks4 > https > http
    pub fn best_protocol(&self) -> Option<Protocol> {
        if self.socks5 {
            Some(Protocol::Socks5)
        } else if self.socks4 {
            Some(Protocol::Socks4)
        } else if self.https {
            Some(Protocol::Https)
        } else if self.http {
            Some(Protocol::Http)
        } else {
            None
        }
    }

    /// Canonical URL with a forced protocol: `protocol://[user:pass@]ip:port`
    pub fn url_with(&self, protocol: Protocol) -> String {
        format!("{}://{}", protocol, self.credentials_ip_port())
    }

    /// One canonical URL per confirmed protocol
    pub fn urls_for_all_protocols(&self) -> Vec<String> {
        self.working_protocols()
            .into_iter()
            .map(|p| self.url_with(p))
            .collect()
    }

    /// List of currently confirmed protocols
    pub fn working_protocols(&self) -> Vec<Protocol> {
        let mut protocols = Vec::new();
        if self.socks5 {
            protocols.push(Protocol::Socks5);
        }
        if self.socks4 {
            protocols.push(Protocol::Socks4);
        }
        if self.https {
            protocols.push(Protocol::Https);
        }
        if self.http {
            protocols.push(Protocol::Http);
        }
        protocols
    }

    /// Rewrite all protocol flags from a list of working protocols
    pub fn set_working_protocols(&mut self, protocols: &[Protocol]) {
        self.socks4 = protocols.contains(&Protocol::Socks4);
        self.socks5 = protocols.contains(&Protocol::Socks5);
        self.http = protocols.contains(&Protocol::Http);
        self.https = protocols.contains(&Protocol::Https);
    }

    pub fn protocol_flag(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Socks4 => self.socks4,
            Protocol::Socks5 => self.socks5,
            Protocol::Http => self.http,
            Protocol::Https => self.https,
        }
    }

    pub fn set_protocol_flag(&mut self, protocol: Protocol, value: bool) {
        match protocol {
            Protocol::Socks4 => self.socks4 = value,
            Protocol::Socks5 => self.socks5 = value,
            Protocol::Http => self.http = value,
            Protocol::Https => self.https = value,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == Some(Status::Alive)
    }
}

impl fmt::Display for Endpoint {
    /// Full canonical URL with the best protocol, bare `[user:pass@]ip:port`
    /// when nothing is confirmed
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.best_protocol() {
            Some(protocol) => write!(f, "{}://{}", protocol, self.credentials_ip_port()),
            None => write!(f, "{}", self.credentials_ip_port()),
        }
    }
}

/// One unit of work for the check queue.
///
/// `protocol = None` means "probe everything"; a concrete protocol means
/// "re-verify this one protocol only". Consumed exactly once by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckJob {
    pub endpoint_id: i64,
    pub protocol: Option<Protocol>,
}

impl CheckJob {
    pub fn new(endpoint_id: i64, protocol: Option<Protocol>) -> Self {
        Self {
            endpoint_id,
            protocol,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::new("1.2.3.4".to_string(), 8080, String::new(), String::new())
    }

    #[test]
    fn test_format_without_credentials() {
        let mut e = endpoint();
        e.socks5 = true;
        e.status = Some(Status::Alive);
        assert_eq!(e.to_string(), "socks5://1.2.3.4:8080");
    }

    #[test]
    fn test_format_with_credentials() {
        let mut e = Endpoint::new(
            "1.2.3.4".to_string(),
            8080,
            "u".to_string(),
            "p".to_string(),
        );
        e.socks5 = true;
        assert_eq!(e.to_string(), "socks5://u:p@1.2.3.4:8080");
    }

    #[test]
    fn test_format_unconfirmed_is_bare() {
        let e = endpoint();
        assert_eq!(e.to_string(), "1.2.3.4:8080");

        let with_auth = Endpoint::new(
            "1.2.3.4".to_string(),
            8080,
            "u".to_string(),
            "p".to_string(),
        );
        assert_eq!(with_auth.to_string(), "u:p@1.2.3.4:8080");
    }

    #[test]
    fn test_best_protocol_preference() {
        let mut e = endpoint();
        e.http = true;
        assert_eq!(e.best_protocol(), Some(Protocol::Http));
        e.https = true;
        assert_eq!(e.best_protocol(), Some(Protocol::Https));
        e.socks4 = true;
        assert_eq!(e.best_protocol(), Some(Protocol::Socks4));
        e.socks5 = true;
        assert_eq!(e.best_protocol(), Some(Protocol::Socks5));
    }

    #[test]
    fn test_working_protocols_round_trip() {
        let mut e = endpoint();
        e.set_working_protocols(&[Protocol::Socks4, Protocol::Https]);
        assert_eq!(
            e.working_protocols(),
            vec![Protocol::Socks4, Protocol::Https]
        );
        assert!(!e.socks5);
        assert!(!e.http);

        e.set_working_protocols(&[]);
        assert!(e.working_protocols().is_empty());
    }

    #[test]
    fn test_urls_for_all_protocols() {
        let mut e = endpoint();
        e.set_working_protocols(&[Protocol::Socks5, Protocol::Http]);
        assert_eq!(
            e.urls_for_all_protocols(),
            vec!["socks5://1.2.3.4:8080", "http://1.2.3.4:8080"]
        );
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("socks4".parse::<Protocol>().unwrap(), Protocol::Socks4);
        assert_eq!("SOCKS5".parse::<Protocol>().unwrap(), Protocol::Socks5);
        assert_eq!("socks5h".parse::<Protocol>().unwrap(), Protocol::Socks5);
        assert_eq!("https".parse::<Protocol>().unwrap(), Protocol::Https);
        assert!("ftp".parse::<Protocol>().is_err());
    }
}
