use crate::test_config::TestConfig;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::c_char;
use std::fmt;
use std::os::raw::c_int;
use std::path::PathBuf;
use std::str::FromStr;

/// Largest UDP block size libiperf handles reliably: 65535 minus the UDP
/// header (8) and the IPv4 header (20).
pub const MAX_UDP_BULKSIZE: u32 = 65535 - 8 - 20;

/// Environment variable consulted by [`LoadOptions::from_env`].
pub const LIBRARY_ENV: &str = "IPERF3_LIBRARY";

/// Library names tried in order when no explicit path is configured.
pub const DEFAULT_LIBRARY_CANDIDATES: &[&str] = &[
    "libiperf.so.0",
    "libiperf.so",
    "libiperf.0.dylib",
    "libiperf.dylib",
];

/// Transport protocol type for network testing.
///
/// # Examples
///
/// ```
/// use iperf3_ffi::Protocol;
///
/// let udp: Protocol = "udp".parse().unwrap();
/// assert_eq!(udp, Protocol::Udp);
/// assert_eq!(Protocol::Tcp.to_string(), "tcp");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Transmission Control Protocol - provides reliable, ordered delivery
    Tcp,
    /// User Datagram Protocol - provides best-effort delivery with lower overhead
    Udp,
}

impl Protocol {
    /// Socket type libiperf uses as the protocol id.
    pub fn id(self) -> c_int {
        match self {
            Protocol::Tcp => libc::SOCK_STREAM,
            Protocol::Udp => libc::SOCK_DGRAM,
        }
    }

    /// Maps an engine protocol id back to a protocol, if it is one we model.
    pub fn from_id(id: c_int) -> Option<Self> {
        match id {
            libc::SOCK_STREAM => Some(Protocol::Tcp),
            libc::SOCK_DGRAM => Some(Protocol::Udp),
            _ => None,
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(Error::Config(format!(
                "Unknown protocol '{}', accepted values are 'tcp' and 'udp'",
                other
            ))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Test role: client or server.
///
/// Fixed when a [`Client`](crate::Client) or [`Server`](crate::Server) is
/// constructed and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Connects to a server and drives the test ('c')
    Client,
    /// Waits for a single client test ('s')
    Server,
}

impl Role {
    /// Role byte as libiperf stores it.
    pub fn as_char(self) -> c_char {
        match self {
            Role::Client => b'c' as c_char,
            Role::Server => b's' as c_char,
        }
    }

    /// Decodes the role byte returned by the engine.
    ///
    /// Anything other than 'c' or 's' (either case) is rejected rather than
    /// guessed at.
    pub fn from_char(raw: c_char) -> Result<Self> {
        match (raw as u8).to_ascii_lowercase() {
            b'c' => Ok(Role::Client),
            b's' => Ok(Role::Server),
            other => Err(Error::Config(format!(
                "Engine reported unknown role byte 0x{:02x}",
                other
            ))),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "c" => Ok(Role::Client),
            "s" => Ok(Role::Server),
            _ => Err(Error::Config(format!(
                "Unknown role '{}', accepted values are 'c' and 's'",
                s
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("c"),
            Role::Server => f.write_str("s"),
        }
    }
}

/// Where to find the libiperf shared library.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadOptions {
    /// Explicit library name or path; `None` tries [`DEFAULT_LIBRARY_CANDIDATES`].
    pub library: Option<PathBuf>,
}

impl LoadOptions {
    /// Creates options that probe the default library names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the library override from `IPERF3_LIBRARY`, if set.
    pub fn from_env() -> Self {
        Self {
            library: std::env::var_os(LIBRARY_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Loads exactly this library instead of probing.
    pub fn with_library(mut self, library: impl Into<PathBuf>) -> Self {
        self.library = Some(library.into());
        self
    }

    /// Names to hand to the dynamic loader, in order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        match &self.library {
            Some(path) => vec![path.clone()],
            None => DEFAULT_LIBRARY_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

/// A batch of test settings that can be written through a [`TestConfig`].
///
/// Every field is optional; unset fields leave the engine's current value
/// alone. Use the builder methods to fill it in, or deserialize it from JSON.
///
/// # Examples
///
/// ```
/// use iperf3_ffi::{Protocol, Settings};
///
/// let settings = Settings::new()
///     .with_server_hostname("192.168.1.100")
///     .with_port(5201)
///     .with_protocol(Protocol::Udp)
///     .with_rate(100_000_000)
///     .with_duration(10);
///
/// assert_eq!(settings.port, Some(5201));
/// assert_eq!(settings.protocol, Some(Protocol::Udp));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address to bind to; "*" for all addresses
    pub bind_address: Option<String>,

    /// Server port
    pub port: Option<u16>,

    /// Produce a JSON report (required for a [`TestResult`](crate::TestResult))
    pub json_output: Option<bool>,

    /// Verbose engine output
    pub verbose: Option<bool>,

    /// Server to connect to (client only)
    pub server_hostname: Option<String>,

    /// Protocol to use (TCP or UDP)
    pub protocol: Option<Protocol>,

    /// Block size in bytes
    pub blksize: Option<u32>,

    /// Number of parallel streams
    pub num_streams: Option<u32>,

    /// Use sendfile() when the platform supports it
    pub zerocopy: Option<bool>,

    /// Reverse mode (server sends, client receives)
    pub reverse: Option<bool>,

    /// Target rate in bits per second
    pub rate: Option<u64>,

    /// Seconds omitted from the start of the test
    pub omit: Option<u32>,

    /// Test duration in seconds
    pub duration: Option<u32>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses settings from a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_json_output(mut self, enabled: bool) -> Self {
        self.json_output = Some(enabled);
        self
    }

    pub fn with_verbose(mut self, enabled: bool) -> Self {
        self.verbose = Some(enabled);
        self
    }

    pub fn with_server_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.server_hostname = Some(hostname.into());
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_blksize(mut self, blksize: u32) -> Self {
        self.blksize = Some(blksize);
        self
    }

    pub fn with_num_streams(mut self, streams: u32) -> Self {
        self.num_streams = Some(streams);
        self
    }

    pub fn with_zerocopy(mut self, enabled: bool) -> Self {
        self.zerocopy = Some(enabled);
        self
    }

    pub fn with_reverse(mut self, enabled: bool) -> Self {
        self.reverse = Some(enabled);
        self
    }

    /// Target rate in bits per second.
    pub fn with_rate(mut self, bits_per_second: u64) -> Self {
        self.rate = Some(bits_per_second);
        self
    }

    pub fn with_omit(mut self, seconds: u32) -> Self {
        self.omit = Some(seconds);
        self
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.duration = Some(seconds);
        self
    }

    /// Writes every set field through `config`.
    ///
    /// Protocol is applied before block size so the UDP clamp sees the final
    /// protocol. The server hostname is not touched here; it only exists for
    /// clients and is applied by [`Client::configure`](crate::Client::configure).
    pub fn apply(&self, config: &TestConfig) -> Result<()> {
        if let Some(address) = &self.bind_address {
            config.set_bind_address(address)?;
        }
        if let Some(port) = self.port {
            config.set_port(port);
        }
        if let Some(enabled) = self.json_output {
            config.set_json_output(enabled);
        }
        if let Some(enabled) = self.verbose {
            config.set_verbose(enabled);
        }
        if let Some(protocol) = self.protocol {
            config.set_protocol(protocol);
        }
        if let Some(blksize) = self.blksize {
            config.set_blksize(blksize)?;
        }
        if let Some(streams) = self.num_streams {
            config.set_num_streams(streams)?;
        }
        if let Some(enabled) = self.zerocopy {
            config.set_zerocopy(enabled);
        }
        if let Some(enabled) = self.reverse {
            config.set_reverse(enabled);
        }
        if let Some(rate) = self.rate {
            config.set_rate(rate);
        }
        if let Some(omit) = self.omit {
            config.set_omit(omit)?;
        }
        if let Some(duration) = self.duration {
            config.set_duration(duration)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("udp".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!(matches!("sctp".parse::<Protocol>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_protocol_id_mapping() {
        assert_eq!(Protocol::from_id(Protocol::Tcp.id()), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_id(Protocol::Udp.id()), Some(Protocol::Udp));
        assert_eq!(Protocol::from_id(-1), None);
    }

    #[test]
    fn test_role_parse_is_case_insensitive() {
        assert_eq!("c".parse::<Role>().unwrap(), Role::Client);
        assert_eq!("C".parse::<Role>().unwrap(), Role::Client);
        assert_eq!("S".parse::<Role>().unwrap(), Role::Server);
        assert!(matches!("x".parse::<Role>(), Err(Error::Config(_))));
        assert!(matches!("client".parse::<Role>(), Err(Error::Config(_))));
    }

    #[test]
    fn test_role_byte_decode() {
        assert_eq!(Role::from_char(Role::Client.as_char()).unwrap(), Role::Client);
        assert_eq!(Role::from_char(b'S' as c_char).unwrap(), Role::Server);
        assert!(Role::from_char(0).is_err());
    }

    #[test]
    fn test_max_udp_bulksize() {
        assert_eq!(MAX_UDP_BULKSIZE, 65507);
    }

    #[test]
    fn test_load_options_candidates() {
        let defaults = LoadOptions::new().candidates();
        assert_eq!(defaults.len(), DEFAULT_LIBRARY_CANDIDATES.len());
        assert_eq!(defaults[0], PathBuf::from("libiperf.so.0"));

        let explicit = LoadOptions::new().with_library("/opt/iperf/lib/libiperf.so");
        assert_eq!(
            explicit.candidates(),
            vec![PathBuf::from("/opt/iperf/lib/libiperf.so")]
        );
    }

    #[test]
    fn test_settings_builder() {
        let settings = Settings::new()
            .with_server_hostname("10.0.0.1")
            .with_port(5202)
            .with_protocol(Protocol::Udp)
            .with_blksize(1400)
            .with_num_streams(4)
            .with_reverse(true)
            .with_duration(30);

        assert_eq!(settings.server_hostname.as_deref(), Some("10.0.0.1"));
        assert_eq!(settings.port, Some(5202));
        assert_eq!(settings.protocol, Some(Protocol::Udp));
        assert_eq!(settings.blksize, Some(1400));
        assert_eq!(settings.num_streams, Some(4));
        assert_eq!(settings.reverse, Some(true));
        assert_eq!(settings.duration, Some(30));
        assert_eq!(settings.rate, None);
    }

    #[test]
    fn test_settings_from_json() {
        let settings =
            Settings::from_json_str(r#"{"port": 5201, "protocol": "udp", "zerocopy": true}"#)
                .unwrap();
        assert_eq!(settings.port, Some(5201));
        assert_eq!(settings.protocol, Some(Protocol::Udp));
        assert_eq!(settings.zerocopy, Some(true));
        assert_eq!(settings.bind_address, None);

        assert!(matches!(
            Settings::from_json_str(r#"{"protocol": "sctp"}"#),
            Err(Error::Json(_))
        ));
    }
}
