//! Process configuration, read from a JSON file.

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};

use crate::{
    context::{ContextConfig, ContextConfigBuilder},
    error::{Error, Result},
    exchange::Role,
    queue_pair::{DEFAULT_GID_INDEX, DEFAULT_PORT_NUM},
    transfer::{
        EngineConfig, EngineConfigBuilder, DEFAULT_POLL_BATCH, DEFAULT_SLOT_COUNT, MAX_POLL_BATCH,
    },
};

/// Default number of initiator peers
const DEFAULT_PEER_NUM: u16 = 1;
/// Default extra connect attempts of the initiator
const DEFAULT_CONNECT_RETRIES: u32 = 50;
/// Default pause between connect attempts
const DEFAULT_CONNECT_RETRY_DELAY_MS: u64 = 200;

/// Which side of the transfer this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Receives the file and drives the barriers
    Server,
    /// Sends the file
    Client,
}

/// Everything a run needs
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server or client
    pub mode: Mode,
    /// TCP port the server listens on, `"8080"` and `8080` are both accepted
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<u16>,
    /// `host:port` the client dials
    #[serde(default)]
    pub address: Option<String>,
    /// Verbose logging
    #[serde(default)]
    pub debug: bool,
    /// Bytes of the registered buffer
    pub mr_size: usize,
    /// RDMA device to open
    pub device_name: String,
    /// File the client sends
    #[serde(default)]
    pub file_name: Option<PathBuf>,
    /// Clients the server waits for
    #[serde(default = "default_peer_num")]
    pub peer_num: u16,
    /// Slots the buffer is split into
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Completions taken per poll
    #[serde(default = "default_poll_batch")]
    pub poll_batch: usize,
    /// Physical port of the device
    #[serde(default = "default_ib_port")]
    pub ib_port: u8,
    /// GID table index
    #[serde(default = "default_gid_index")]
    pub gid_index: u8,
    /// Extra connect attempts before the client gives up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Milliseconds between connect attempts
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// Requested completion queue depth
    #[serde(default)]
    pub cq_depth: Option<u32>,
    /// Requested shared receive queue depth
    #[serde(default)]
    pub srq_depth: Option<u32>,
    /// Requested send queue depth
    #[serde(default)]
    pub qp_depth: Option<u32>,
}

fn default_peer_num() -> u16 {
    DEFAULT_PEER_NUM
}

fn default_slot_count() -> u32 {
    DEFAULT_SLOT_COUNT
}

fn default_poll_batch() -> usize {
    DEFAULT_POLL_BATCH
}

fn default_ib_port() -> u8 {
    DEFAULT_PORT_NUM
}

fn default_gid_index() -> u8 {
    DEFAULT_GID_INDEX
}

fn default_connect_retries() -> u32 {
    DEFAULT_CONNECT_RETRIES
}

fn default_connect_retry_delay_ms() -> u64 {
    DEFAULT_CONNECT_RETRY_DELAY_MS
}

/// A port written either as a number or as a string, optionally with a leading `:`
#[derive(Deserialize)]
#[serde(untagged)]
#[allow(variant_size_differences)]
enum PortRepr {
    /// `8080`
    Number(u16),
    /// `"8080"` or `":8080"`
    Text(String),
}

#[allow(single_use_lifetimes)]
fn deserialize_port<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<u16>, D::Error> {
    match Option::<PortRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortRepr::Number(port)) => Ok(Some(port)),
        Some(PortRepr::Text(text)) => {
            let text = text.trim().trim_start_matches(':');
            if text.is_empty() {
                return Ok(None);
            }
            text.parse().map(Some).map_err(serde::de::Error::custom)
        }
    }
}

impl Config {
    /// Read and validate the file at `path`
    #[inline]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|err| match err {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Parse and validate a JSON document
    #[inline]
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check what serde cannot: per-mode required fields and sizing
    #[inline]
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Server => {
                if self.port.is_none() {
                    return Err(Error::Config("server mode needs a port".to_owned()));
                }
            }
            Mode::Client => {
                if self.address.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::Config("client mode needs an address".to_owned()));
                }
                if self.file_name.as_ref().map_or(true, |f| f.as_os_str().is_empty()) {
                    return Err(Error::Config("client mode needs a file_name".to_owned()));
                }
            }
        }
        if self.device_name.is_empty() {
            return Err(Error::Config("device_name is empty".to_owned()));
        }
        if self.peer_num == 0 {
            return Err(Error::Config("peer_num must be positive".to_owned()));
        }
        if u64::from(self.slot_count) <= u64::from(self.peer_num).saturating_mul(2) {
            return Err(Error::Config(format!(
                "slot_count {} must exceed twice peer_num {}",
                self.slot_count, self.peer_num
            )));
        }
        let slots = usize::try_from(self.slot_count).unwrap_or(usize::MAX);
        if self.mr_size.checked_div(slots).unwrap_or(0) == 0 {
            return Err(Error::Config(format!(
                "mr_size {} is too small for {} slots",
                self.mr_size, self.slot_count
            )));
        }
        // a poll never needs more entries than the completion queue holds
        let max_batch = self.cq_depth.map_or(MAX_POLL_BATCH, |depth| {
            usize::try_from(depth).map_or(MAX_POLL_BATCH, |depth| depth.min(MAX_POLL_BATCH))
        });
        if self.poll_batch == 0 || self.poll_batch > max_batch {
            return Err(Error::Config(format!(
                "poll_batch {} is outside 1..={max_batch}",
                self.poll_batch
            )));
        }
        Ok(())
    }

    /// Device side settings
    #[inline]
    pub fn context_config(&self) -> Result<ContextConfig> {
        ContextConfigBuilder::default()
            .device_name(self.device_name.as_str())
            .mr_size(self.mr_size)
            .ib_port(self.ib_port)
            .gid_index(self.gid_index)
            .cq_depth(self.cq_depth)
            .srq_depth(self.srq_depth)
            .qp_depth(self.qp_depth)
            .build()
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// Engine tunables
    #[inline]
    pub fn engine_config(&self) -> Result<EngineConfig> {
        EngineConfigBuilder::default()
            .peer_num(self.peer_num)
            .slot_count(self.slot_count)
            .poll_batch(self.poll_batch)
            .build()
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// Control channel role, the server listens on every interface
    #[inline]
    pub fn role(&self) -> Result<Role> {
        match self.mode {
            Mode::Server => {
                let port = self
                    .port
                    .ok_or_else(|| Error::Config("server mode needs a port".to_owned()))?;
                Ok(Role::Responder {
                    bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
                })
            }
            Mode::Client => {
                let addr = self
                    .address
                    .clone()
                    .ok_or_else(|| Error::Config("client mode needs an address".to_owned()))?;
                Ok(Role::Initiator {
                    addr,
                    retries: self.connect_retries,
                    retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
                })
            }
        }
    }
}
