use crate::config::{LoadOptions, Role, Settings};
use crate::engine::Engine;
use crate::ffi::LibIperf;
use crate::result::TestResult;
use crate::test_config::TestConfig;
use crate::Result;
use log::{debug, info, warn};
use std::sync::Arc;

/// Engines whose version string starts with this expose the report through
/// `iperf_get_test_json_output_string` instead of stdout.
pub const JSON_ACCESSOR_VERSION_PREFIX: &str = "iperf 3.1";

/// Decides from the engine version string whether to read the report through
/// the JSON accessor (`true`) or from captured stdout (`false`).
pub type VersionPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

const CONTROL_PREAMBLE: &str = "Control connection";

/// iperf3 test client.
///
/// Connects to a running iperf3 server and runs one test per call to
/// [`Client::run`]. Configuration goes through [`Client::config`] or
/// [`Client::configure`].
///
/// # Examples
///
/// ```no_run
/// use iperf3_ffi::Client;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new()?;
/// client.set_server_hostname("127.0.0.1")?;
/// client.config().set_port(5201);
/// client.config().set_duration(1)?;
///
/// if let Some(result) = client.run()? {
///     match result.error() {
///         Some(message) => eprintln!("test failed: {}", message),
///         None => println!("{}", result.text()),
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    config: TestConfig,
    json_accessor_versions: VersionPredicate,
}

impl Client {
    /// Loads libiperf (honouring `IPERF3_LIBRARY`) and allocates a client test.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`](crate::Error::Load) if no libiperf can be
    /// loaded.
    pub fn new() -> Result<Self> {
        Self::with_options(&LoadOptions::from_env())
    }

    /// Like [`Client::new`] with explicit load options.
    pub fn with_options(options: &LoadOptions) -> Result<Self> {
        Self::with_engine(Arc::new(LibIperf::load(options)?))
    }

    /// Allocates a client test on an already loaded engine.
    ///
    /// The test starts from engine defaults with JSON output and verbose
    /// output enabled.
    pub fn with_engine(engine: Arc<dyn Engine>) -> Result<Self> {
        let config = TestConfig::new(engine, Role::Client)?;
        config.set_json_output(true);
        config.set_verbose(true);
        Ok(Self {
            config,
            json_accessor_versions: Arc::new(|version| {
                version.starts_with(JSON_ACCESSOR_VERSION_PREFIX)
            }),
        })
    }

    /// Replaces the version check that selects the JSON accessor over
    /// captured stdout.
    pub fn with_json_accessor_versions<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.json_accessor_versions = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Server the client connects to, if one is set.
    pub fn server_hostname(&self) -> Option<String> {
        self.config.server_hostname()
    }

    /// Sets the server to connect to; accepts DNS names and IP addresses.
    pub fn set_server_hostname(&self, hostname: &str) -> Result<()> {
        self.config.set_server_hostname(hostname)
    }

    /// Applies `settings`, including the server hostname.
    pub fn configure(&self, settings: &Settings) -> Result<()> {
        settings.apply(&self.config)?;
        if let Some(hostname) = &settings.server_hostname {
            self.set_server_hostname(hostname)?;
        }
        Ok(())
    }

    /// Runs one test, blocking the calling thread for its whole duration.
    ///
    /// With JSON output enabled the engine's report is captured and returned
    /// as `Some(result)`. Engine failures do not produce an `Err`: they come
    /// back as a result whose [`error`](TestResult::error) is set.
    ///
    /// With JSON output disabled the engine prints its human-readable report
    /// to the console and `Ok(None)` is returned.
    ///
    /// # Errors
    ///
    /// Only capture failures are raised: another capture active in the
    /// process ([`Error::CaptureBusy`](crate::Error::CaptureBusy)) or a
    /// descriptor operation failing ([`Error::Io`](crate::Error::Io)).
    pub fn run(&self) -> Result<Option<TestResult>> {
        let shared = self.config.shared();
        let handle = shared.handle.lock();
        let engine = handle.engine();
        let test = handle.test();

        if engine.json_output(test) == 0 {
            info!("Running client in console mode");
            if engine.run_client(test) != 0 {
                let errno = engine.errno();
                warn!("Client run failed: {}", engine.strerror(errno));
            }
            return Ok(None);
        }

        debug!(
            "Running client against {}:{}",
            engine.server_hostname(test).unwrap_or_default(),
            engine.server_port(test)
        );

        let redirect = shared.capture.redirect()?;
        let code = engine.run_client(test);
        // i_errno is process-wide; read it before anything else can touch it.
        let errno = engine.errno();

        let version = engine.version();
        let reported = if (self.json_accessor_versions)(&version) {
            if engine.has_json_output_string() {
                engine.json_output_string(test)
            } else {
                debug!("{} has no JSON accessor, using captured output", version);
                None
            }
        } else {
            None
        };

        redirect.restore()?;
        // Always empty the pipe so nothing leaks into the next run.
        let captured = shared.capture.drain()?;

        let text = match reported {
            Some(text) => text,
            None => strip_control_preamble(captured),
        };

        let result = TestResult::from_run(text, code, || engine.strerror(errno));
        if let Some(message) = result.error() {
            warn!("Client run failed: {}", message);
        } else {
            info!("Client run completed");
        }
        Ok(Some(result))
    }
}

/// Drops the connection log some engines print ahead of the JSON report.
fn strip_control_preamble(text: String) -> String {
    if !text.starts_with(CONTROL_PREAMBLE) {
        return text;
    }
    match text.find('{') {
        Some(start) => text[start..].to_string(),
        None => text,
    }
}
