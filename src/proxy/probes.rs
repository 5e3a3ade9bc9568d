//! Wire-level protocol probes
//!
//! One probe per protocol family. Each probe opens exactly one connection,
//! always closes it, and fails closed: refused connections, resets, malformed
//! replies and protocol violations all produce `false`, never an error.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS4 "request granted" reply code
const SOCKS4_REQUEST_GRANTED: u8 = 0x5A;
const SOCKS4_VERSION: u8 = 0x04;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_PASSWORD: u8 = 0x02;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAINNAME: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;
const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;

/// Synthetic, non-routable destination used in connect requests. The probe
/// only has to confirm the server grants a connection, not tunnel traffic.
const SYNTHETIC_DST_IP: [u8; 4] = [1, 1, 1, 1];
const SYNTHETIC_DST_PORT: u16 = 80;

/// Well-known echo endpoint for the HTTP(S) probe, scheme added per variant
pub const DEFAULT_ECHO_ENDPOINT: &str = "httpbin.org/get";

/// Marker header sent through the proxy and expected back in the echo body
const ECHO_HEADER_NAME: &str = "X-Test";
const ECHO_HEADER_VALUE: &str = "check me";

/// Hard client-side cap for the HTTP(S) probe, independent of the generic
/// retry wrapper's per-attempt timeout
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection parameters shared by all probes
#[derive(Debug, Clone)]
pub struct ProbeParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProbeParams {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

/// Check that the endpoint speaks SOCKS4(a).
///
/// Sends `VER CMD DSTPORT DSTIP USERID NUL` and expects an 8-byte reply whose
/// second byte is 0x5A (request granted).
pub async fn check_socks4(params: &ProbeParams) -> bool {
    match socks4_handshake(params).await {
        Ok(granted) => granted,
        Err(e) => {
            debug!(
                "socks4://{}:{} probe failed: {}",
                params.host, params.port, e
            );
            false
        }
    }
}

async fn socks4_handshake(params: &ProbeParams) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect((params.host.as_str(), params.port)).await?;

    // USERID field: "username[:password]" when credentials are present
    let mut user_id: Vec<u8> = Vec::new();
    if let Some(username) = &params.username {
        user_id.extend_from_slice(username.as_bytes());
        if let Some(password) = &params.password {
            user_id.push(b':');
            user_id.extend_from_slice(password.as_bytes());
        }
    }

    let mut request = vec![SOCKS4_VERSION, 0x01];
    request.extend_from_slice(&SYNTHETIC_DST_PORT.to_be_bytes());
    request.extend_from_slice(&SYNTHETIC_DST_IP);
    request.extend_from_slice(&user_id);
    request.push(0x00);

    stream.write_all(&request).await?;

    // reply is VN CD DSTPORT DSTIP; fill what the server gives us, up to 8
    let mut reply = [0u8; 8];
    let mut filled = 0;
    while filled < reply.len() {
        let n = stream.read(&mut reply[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled < 2 {
        // not enough data to read the status
        return Ok(false);
    }

    Ok(reply[1] == SOCKS4_REQUEST_GRANTED)
}

/// Check that the endpoint speaks SOCKS5.
///
/// Full RFC 1928 handshake: method negotiation, optional RFC 1929
/// username/password subnegotiation, then a CONNECT request to a synthetic
/// destination. Verdict is the REP byte of the reply.
pub async fn check_socks5(params: &ProbeParams) -> bool {
    match socks5_handshake(params).await {
        Ok(succeeded) => succeeded,
        Err(e) => {
            debug!(
                "socks5://{}:{} probe failed: {}",
                params.host, params.port, e
            );
            false
        }
    }
}

async fn socks5_handshake(params: &ProbeParams) -> std::io::Result<bool> {
    let mut stream = TcpStream::connect((params.host.as_str(), params.port)).await?;

    let have_credentials = params.username.is_some() && params.password.is_some();

    // greeting: offer NO_AUTH, plus USERNAME/PASSWORD when we can satisfy it
    let greeting: Vec<u8> = if have_credentials {
        vec![SOCKS5_VERSION, 2, SOCKS5_AUTH_NONE, SOCKS5_AUTH_PASSWORD]
    } else {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_NONE]
    };
    stream.write_all(&greeting).await?;

    let mut method_reply = [0u8; 2];
    stream.read_exact(&mut method_reply).await?;

    if method_reply[0] != SOCKS5_VERSION {
        debug!(
            "socks5://{}:{} replied with version {}",
            params.host, params.port, method_reply[0]
        );
        return Ok(false);
    }

    match method_reply[1] {
        SOCKS5_AUTH_NONE => {}
        SOCKS5_AUTH_PASSWORD => {
            let (username, password) = match (&params.username, &params.password) {
                (Some(u), Some(p)) => (u.as_bytes(), p.as_bytes()),
                // server picked a method we never offered
                _ => return Ok(false),
            };

            let mut auth_request = vec![0x01, username.len() as u8];
            auth_request.extend_from_slice(username);
            auth_request.push(password.len() as u8);
            auth_request.extend_from_slice(password);
            stream.write_all(&auth_request).await?;

            let mut auth_reply = [0u8; 2];
            stream.read_exact(&mut auth_reply).await?;
            if auth_reply[1] != 0x00 {
                debug!("socks5://{}:{} rejected auth", params.host, params.port);
                return Ok(false);
            }
        }
        // 0xFF "no acceptable methods" or anything we cannot speak
        _ => return Ok(false),
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00, SOCKS5_ATYP_IPV4];
    request.extend_from_slice(&SYNTHETIC_DST_IP);
    request.extend_from_slice(&SYNTHETIC_DST_PORT.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply_head = [0u8; 4];
    stream.read_exact(&mut reply_head).await?;

    if reply_head[0] != SOCKS5_VERSION {
        return Ok(false);
    }

    let succeeded = reply_head[1] == SOCKS5_REPLY_SUCCEEDED;

    if succeeded {
        // drain BND.ADDR + BND.PORT so the socket is not closed mid-reply
        match reply_head[3] {
            SOCKS5_ATYP_IPV4 => {
                let mut rest = [0u8; 4 + 2];
                stream.read_exact(&mut rest).await?;
            }
            SOCKS5_ATYP_DOMAINNAME => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut rest = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut rest).await?;
            }
            SOCKS5_ATYP_IPV6 => {
                let mut rest = [0u8; 16 + 2];
                stream.read_exact(&mut rest).await?;
            }
            _ => return Ok(false),
        }
    }

    Ok(succeeded)
}

/// Check that the endpoint is a real HTTP(S) forward proxy.
///
/// Issues a GET through the proxy to an external echo endpoint with a marker
/// header; verdict is HTTP 200 plus the marker echoed in the body, which
/// filters out transparent gateways that answer without proxying. The HTTPS
/// variant differs only in the scheme used for the proxy and the echo URL.
pub async fn check_http(params: &ProbeParams, secured: bool, echo_endpoint: &str) -> bool {
    let scheme = if secured { "https" } else { "http" };

    let credentials = match (&params.username, &params.password) {
        (Some(u), Some(p)) => format!("{}:{}@", u, p),
        _ => String::new(),
    };
    let proxy_url = format!("{}://{}{}:{}", scheme, credentials, params.host, params.port);

    match http_request_via(&proxy_url, scheme, echo_endpoint).await {
        Ok(echoed) => echoed,
        Err(e) => {
            debug!("{}:{} http probe failed: {}", params.host, params.port, e);
            false
        }
    }
}

async fn http_request_via(
    proxy_url: &str,
    scheme: &str,
    echo_endpoint: &str,
) -> crate::Result<bool> {
    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(proxy_url)?)
        .timeout(HTTP_PROBE_TIMEOUT)
        .build()?;

    let response = client
        .get(format!("{}://{}", scheme, echo_endpoint))
        .header(ECHO_HEADER_NAME, ECHO_HEADER_VALUE)
        .send()
        .await?;

    if response.status() != reqwest::StatusCode::OK {
        return Ok(false);
    }

    let body = response.text().await?;
    Ok(body.contains(ECHO_HEADER_VALUE))
}
