use crate::capture::StdoutCapture;
use crate::config::{Protocol, Role, MAX_UDP_BULKSIZE};
use crate::engine::{Engine, TestHandle, TestPtr};
use crate::{Error, Result};
use log::debug;
use parking_lot::Mutex;
use std::ffi::CString;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared between a facade and any worker running a test on it.
pub(crate) struct Shared {
    pub(crate) handle: Mutex<TestHandle>,
    pub(crate) capture: StdoutCapture,
    zerocopy: AtomicBool,
}

/// Typed view of one engine test's configuration.
///
/// Every getter re-reads the engine and every setter writes through
/// immediately; the engine is always the authoritative copy. The one
/// exception is zero-copy, for which libiperf has no getter: its value is the
/// last one accepted by [`TestConfig::set_zerocopy`].
///
/// Calls take the test's lock, so while a server run is in progress on
/// another thread they wait for it to finish.
#[derive(Clone)]
pub struct TestConfig {
    shared: Arc<Shared>,
}

impl TestConfig {
    /// Allocates a test for `role` and prepares its capture pipe.
    ///
    /// If the pipe cannot be created the freshly allocated test is released
    /// before the error is returned.
    pub(crate) fn new(engine: Arc<dyn Engine>, role: Role) -> Result<Self> {
        let handle = TestHandle::new(engine, role)?;
        let capture = StdoutCapture::new()?;
        Ok(Self {
            shared: Arc::new(Shared {
                handle: Mutex::new(handle),
                capture,
                zerocopy: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn with_engine<R>(&self, f: impl FnOnce(&dyn Engine, TestPtr) -> R) -> R {
        let handle = self.shared.handle.lock();
        f(handle.engine(), handle.test())
    }

    /// Role as the engine reports it.
    ///
    /// Falls back to the construction role if the engine returns a byte that
    /// is neither 'c' nor 's'.
    pub fn role(&self) -> Role {
        let handle = self.shared.handle.lock();
        let raw = handle.engine().role(handle.test());
        Role::from_char(raw).unwrap_or_else(|e| {
            debug!("{}; using construction role", e);
            handle.role()
        })
    }

    /// Re-asserts the role.
    ///
    /// The role is fixed at construction: values other than "c" or "s"
    /// (either case) and any change away from the construction role are
    /// rejected with [`Error::Config`].
    pub fn set_role(&self, role: &str) -> Result<()> {
        let requested: Role = role.parse()?;
        let handle = self.shared.handle.lock();
        if requested != handle.role() {
            return Err(Error::Config(format!(
                "Role is fixed at construction as '{}', cannot change it to '{}'",
                handle.role(),
                requested
            )));
        }
        handle.engine().set_role(handle.test(), requested.as_char());
        Ok(())
    }

    /// Address the test binds to; "*" means all addresses.
    pub fn bind_address(&self) -> String {
        self.with_engine(|engine, test| engine.bind_address(test))
            .filter(|address| !address.is_empty())
            .unwrap_or_else(|| "*".to_string())
    }

    pub fn set_bind_address(&self, address: &str) -> Result<()> {
        let address = to_c_string("bind address", address)?;
        self.with_engine(|engine, test| engine.set_bind_address(test, &address));
        Ok(())
    }

    pub fn port(&self) -> u16 {
        let raw = self.with_engine(|engine, test| engine.server_port(test));
        u16::try_from(raw).unwrap_or_else(|_| {
            debug!("Engine reported port {} outside 0..=65535, reading as 0", raw);
            0
        })
    }

    pub fn set_port(&self, port: u16) {
        self.with_engine(|engine, test| engine.set_server_port(test, c_int::from(port)));
    }

    /// Whether the engine produces a JSON report. Runs only return a
    /// [`TestResult`](crate::TestResult) when this is on.
    pub fn json_output(&self) -> bool {
        self.with_engine(|engine, test| engine.json_output(test) != 0)
    }

    pub fn set_json_output(&self, enabled: bool) {
        self.with_engine(|engine, test| engine.set_json_output(test, c_int::from(enabled)));
    }

    pub fn verbose(&self) -> bool {
        self.with_engine(|engine, test| engine.verbose(test) != 0)
    }

    pub fn set_verbose(&self, enabled: bool) {
        self.with_engine(|engine, test| engine.set_verbose(test, c_int::from(enabled)));
    }

    /// Current protocol, or `None` if the engine is set to one we don't model.
    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::from_id(self.with_engine(|engine, test| engine.protocol_id(test)))
    }

    /// Switches protocol. Moving to UDP clamps an oversized block size to
    /// [`MAX_UDP_BULKSIZE`].
    pub fn set_protocol(&self, protocol: Protocol) {
        self.with_engine(|engine, test| {
            engine.set_protocol(test, protocol.id());
            if protocol == Protocol::Udp && engine.blksize(test) > udp_limit() {
                debug!("Clamping block size to {} for UDP", MAX_UDP_BULKSIZE);
                engine.set_blksize(test, udp_limit());
            }
        });
    }

    /// Like [`set_protocol`](Self::set_protocol), from "tcp" or "udp".
    pub fn set_protocol_str(&self, protocol: &str) -> Result<()> {
        self.set_protocol(protocol.parse()?);
        Ok(())
    }

    pub fn omit(&self) -> u32 {
        to_unsigned(self.with_engine(|engine, test| engine.omit(test)))
    }

    pub fn set_omit(&self, seconds: u32) -> Result<()> {
        let seconds = to_c_int("omit", seconds)?;
        self.with_engine(|engine, test| engine.set_omit(test, seconds));
        Ok(())
    }

    /// Test duration in seconds.
    pub fn duration(&self) -> u32 {
        to_unsigned(self.with_engine(|engine, test| engine.duration(test)))
    }

    pub fn set_duration(&self, seconds: u32) -> Result<()> {
        let seconds = to_c_int("duration", seconds)?;
        self.with_engine(|engine, test| engine.set_duration(test, seconds));
        Ok(())
    }

    /// Target rate in bits per second.
    pub fn rate(&self) -> u64 {
        self.with_engine(|engine, test| engine.rate(test))
    }

    pub fn set_rate(&self, bits_per_second: u64) {
        self.with_engine(|engine, test| engine.set_rate(test, bits_per_second));
    }

    pub fn blksize(&self) -> u32 {
        to_unsigned(self.with_engine(|engine, test| engine.blksize(test)))
    }

    /// Sets the block size, clamped to [`MAX_UDP_BULKSIZE`] while the
    /// protocol is UDP.
    pub fn set_blksize(&self, blksize: u32) -> Result<()> {
        let requested = to_c_int("block size", blksize)?;
        self.with_engine(|engine, test| {
            let udp = Protocol::from_id(engine.protocol_id(test)) == Some(Protocol::Udp);
            let blksize = if udp && requested > udp_limit() {
                debug!("Clamping block size {} to {} for UDP", requested, MAX_UDP_BULKSIZE);
                udp_limit()
            } else {
                requested
            };
            engine.set_blksize(test, blksize);
        });
        Ok(())
    }

    pub fn num_streams(&self) -> u32 {
        to_unsigned(self.with_engine(|engine, test| engine.num_streams(test)))
    }

    pub fn set_num_streams(&self, streams: u32) -> Result<()> {
        let streams = to_c_int("stream count", streams)?;
        self.with_engine(|engine, test| engine.set_num_streams(test, streams));
        Ok(())
    }

    /// Last accepted zero-copy setting. libiperf offers no getter, so this
    /// reflects [`set_zerocopy`](Self::set_zerocopy) rather than the engine.
    pub fn zerocopy(&self) -> bool {
        self.shared.zerocopy.load(Ordering::Acquire)
    }

    /// Enables sendfile() transfers when the platform supports them.
    ///
    /// Without engine support the request degrades to disabled: the engine
    /// is told to disable zero-copy and [`zerocopy`](Self::zerocopy) reads
    /// false.
    pub fn set_zerocopy(&self, enabled: bool) {
        self.with_engine(|engine, test| {
            let effective = enabled && engine.has_zerocopy() != 0;
            if enabled && !effective {
                debug!("Zero-copy requested but not supported by the engine, leaving it off");
            }
            engine.set_zerocopy(test, c_int::from(effective));
            // Under the handle lock so the cache matches the engine's last write.
            self.shared.zerocopy.store(effective, Ordering::Release);
        });
    }

    pub fn reverse(&self) -> bool {
        self.with_engine(|engine, test| engine.reverse(test) != 0)
    }

    pub fn set_reverse(&self, enabled: bool) {
        self.with_engine(|engine, test| engine.set_reverse(test, c_int::from(enabled)));
    }

    /// Resets every field to the engine's defaults.
    ///
    /// The role stays the one fixed at construction and zero-copy reads
    /// false afterwards. JSON and verbose output come back as the engine
    /// defaults them, which is off.
    pub fn reset_defaults(&self) {
        let handle = self.shared.handle.lock();
        let (engine, test) = (handle.engine(), handle.test());
        engine.defaults(test);
        engine.set_role(test, handle.role().as_char());
        self.shared.zerocopy.store(false, Ordering::Release);
        debug!("Reset test to engine defaults");
    }

    /// Engine version string, e.g. "iperf 3.9".
    pub fn engine_version(&self) -> String {
        self.with_engine(|engine, _| engine.version())
    }

    pub(crate) fn server_hostname(&self) -> Option<String> {
        self.with_engine(|engine, test| engine.server_hostname(test))
            .filter(|hostname| !hostname.is_empty())
    }

    pub(crate) fn set_server_hostname(&self, hostname: &str) -> Result<()> {
        let hostname = to_c_string("server hostname", hostname)?;
        self.with_engine(|engine, test| engine.set_server_hostname(test, &hostname));
        Ok(())
    }
}

fn udp_limit() -> c_int {
    MAX_UDP_BULKSIZE as c_int
}

fn to_c_string(field: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| Error::Config(format!("{} must not contain NUL bytes", field)))
}

fn to_c_int(field: &str, value: u32) -> Result<c_int> {
    c_int::try_from(value)
        .map_err(|_| Error::Config(format!("{} {} is out of range", field, value)))
}

fn to_unsigned(raw: c_int) -> u32 {
    u32::try_from(raw).unwrap_or_else(|_| {
        debug!("Engine reported negative value {}, reading as 0", raw);
        0
    })
}
