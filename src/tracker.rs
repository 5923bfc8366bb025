use async_trait::async_trait;
use percent_encoding::{NON_ALPHANUMERIC, percent_encode};
use reqwest::Client;
use serde::Deserialize;
use serde_bencode::value::Value;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::ApplicationError;

/// Lifecycle event reported with an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Completed,
    Stopped,
    /// Regular re-announce
    Empty,
}

impl AnnounceEvent {
    fn as_param(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Empty => None,
        }
    }
}

/// Parameters of one announce
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

/// Peers and re-announce interval returned by a tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub peers: Vec<SocketAddr>,
    /// Seconds to wait before the next regular announce
    pub interval: Option<u64>,
}

/// Anything that can hand out peer addresses for a torrent.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, ApplicationError>;
}

/// Raw tracker response as bencoded on the wire
#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<i64>,
    peers: Option<Value>,
}

impl AnnounceResponse {
    /// Decodes a bencoded tracker reply.
    pub fn from_bencode(raw: &[u8]) -> Result<Self, ApplicationError> {
        let resp: RawResponse = serde_bencode::from_bytes(raw)
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        if let Some(reason) = resp.failure_reason {
            return Err(ApplicationError::TrackerError(reason));
        }

        let peers = match &resp.peers {
            Some(value) => parse_peers(value),
            None => Vec::new(),
        };

        Ok(Self {
            peers,
            interval: resp.interval.filter(|i| *i > 0).map(|i| i as u64),
        })
    }
}

fn parse_peers(value: &Value) -> Vec<SocketAddr> {
    match value {
        // Compact form: 4 bytes of IPv4 address then 2 bytes of port,
        // both big-endian. A trailing partial entry is dropped.
        Value::Bytes(data) => data
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect(),

        // Dictionary form: a list of {"ip": string, "port": int}
        Value::List(list) => list
            .iter()
            .filter_map(|item| {
                let Value::Dict(dict) = item else {
                    return None;
                };

                let ip = dict
                    .get(&b"ip".to_vec())
                    .and_then(|v| match v {
                        Value::Bytes(b) => std::str::from_utf8(b).ok(),
                        _ => None,
                    })
                    .and_then(|s| s.parse::<IpAddr>().ok())?;

                let port = dict.get(&b"port".to_vec()).and_then(|v| match v {
                    Value::Int(n) => u16::try_from(*n).ok(),
                    _ => None,
                })?;

                Some(SocketAddr::new(ip, port))
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Handles communication with an HTTP(S) BitTorrent tracker
pub struct Tracker {
    announce: Url,
    client: Client,
}

impl Tracker {
    pub fn new(announce: &str, timeout: Duration) -> Result<Self, ApplicationError> {
        let announce = Url::parse(announce)
            .map_err(|e| ApplicationError::TrackerError(format!("{}: {}", announce, e)))?;

        match announce.scheme() {
            "http" | "https" => {}
            other => {
                return Err(ApplicationError::TrackerError(format!(
                    "unsupported tracker scheme {:?}",
                    other
                )));
            }
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        Ok(Self { announce, client })
    }

    /// Builds the announce URL. Binary fields are percent-encoded by hand,
    /// `Url`'s query serializer would treat them as UTF-8 text.
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let mut params = vec![
            ("info_hash", percent_encode(&request.info_hash, NON_ALPHANUMERIC).to_string()),
            ("peer_id", percent_encode(&request.peer_id, NON_ALPHANUMERIC).to_string()),
            ("port", request.port.to_string()),
            ("uploaded", request.uploaded.to_string()),
            ("downloaded", request.downloaded.to_string()),
            ("left", request.left.to_string()),
            ("compact", "1".to_string()),
        ];
        if let Some(event) = request.event.as_param() {
            params.push(("event", event.to_string()));
        }

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");

        let separator = if self.announce.query().is_some() { '&' } else { '?' };
        format!("{}{}{}", self.announce, separator, query)
    }
}

#[async_trait]
impl Announcer for Tracker {
    async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, ApplicationError> {
        let url = self.announce_url(request);
        debug!(url = %url, event = ?request.event, "announcing");

        let raw = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?
            .bytes()
            .await
            .map_err(|e| ApplicationError::TrackerError(format!("{}", e)))?;

        let response = AnnounceResponse::from_bencode(&raw)?;
        debug!(peers = response.peers.len(), interval = ?response.interval, "tracker replied");
        Ok(response)
    }
}
