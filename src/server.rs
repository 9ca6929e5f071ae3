use crate::config::{LoadOptions, Role, Settings};
use crate::engine::Engine;
use crate::ffi::LibIperf;
use crate::result::TestResult;
use crate::test_config::{Shared, TestConfig};
use crate::{Error, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// iperf3 test server.
///
/// Each call to [`Server::run`] serves exactly one client test and then
/// resets the engine, so a long-lived server calls it in a loop.
///
/// The blocking engine call runs on a dedicated worker thread. The caller
/// awaits its result together with the server's cancellation token and
/// optional timeout, so a Ctrl+C handler can always get control back.
/// Cancelling or timing out releases the caller only: the in-flight engine
/// call keeps the test locked until a client has been served, and the next
/// [`Server::run`] hands back that client's report instead of starting a new
/// worker.
///
/// # Examples
///
/// ```no_run
/// use iperf3_ffi::Server;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new()?;
/// server.config().set_port(5201);
///
/// let cancel_token = server.cancellation_token().clone();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     cancel_token.cancel();
/// });
///
/// while let Ok(Some(result)) = server.run().await {
///     println!("{}", result.text());
/// }
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: TestConfig,
    cancellation_token: CancellationToken,
    timeout: Option<Duration>,
    pending: Mutex<Option<oneshot::Receiver<Outcome>>>,
}

type Outcome = Result<Option<TestResult>>;

impl Server {
    /// Loads libiperf (honouring `IPERF3_LIBRARY`) and allocates a server test.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Load`] if no libiperf can be loaded.
    pub fn new() -> Result<Self> {
        Self::with_options(&LoadOptions::from_env())
    }

    /// Like [`Server::new`] with explicit load options.
    pub fn with_options(options: &LoadOptions) -> Result<Self> {
        Self::with_engine(Arc::new(LibIperf::load(options)?))
    }

    /// Allocates a server test on an already loaded engine.
    ///
    /// The test starts from engine defaults with JSON output and verbose
    /// output enabled.
    pub fn with_engine(engine: Arc<dyn Engine>) -> Result<Self> {
        let config = TestConfig::new(engine, Role::Server)?;
        config.set_json_output(true);
        config.set_verbose(true);
        Ok(Self {
            config,
            cancellation_token: CancellationToken::new(),
            timeout: None,
            pending: Mutex::new(None),
        })
    }

    /// Gives up waiting for a client after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &TestConfig {
        &self.config
    }

    /// Applies `settings`. A server hostname in `settings` is ignored.
    pub fn configure(&self, settings: &Settings) -> Result<()> {
        if settings.server_hostname.is_some() {
            debug!("Ignoring server hostname in server settings");
        }
        settings.apply(&self.config)
    }

    /// Returns a reference to the cancellation token.
    ///
    /// Cancelling it makes the pending and every later [`Server::run`] return
    /// [`Error::Cancelled`].
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Serves one client test.
    ///
    /// With JSON output enabled the report is returned as `Some(result)`;
    /// engine failures come back as a result whose
    /// [`error`](TestResult::error) is set. With JSON output disabled the
    /// engine prints to the console and `Ok(None)` is returned.
    ///
    /// If an earlier call stopped waiting before its worker finished, this
    /// call waits for that worker and returns its report; no new client is
    /// served until it has been collected.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] when the cancellation token fires
    /// - [`Error::Timeout`] when the configured timeout elapses
    /// - [`Error::CaptureBusy`] or [`Error::Io`] when stdout can't be captured
    /// - [`Error::WorkerLost`] if the worker died without a result
    pub async fn run(&self) -> Result<Option<TestResult>> {
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let pending = self.pending.lock().take();
        let rx = match pending {
            Some(rx) => {
                debug!("Collecting the report of an earlier server run");
                rx
            }
            None => self.spawn_worker()?,
        };
        self.wait_for(rx).await
    }

    fn spawn_worker(&self) -> Result<oneshot::Receiver<Outcome>> {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(self.config.shared());
        thread::Builder::new()
            .name("iperf3-server".to_string())
            .spawn(move || {
                let outcome = serve_once(&shared);
                if let Err(outcome) = tx.send(outcome) {
                    match outcome {
                        Ok(Some(result)) => warn!(
                            "Server dropped before collecting a served report: {}",
                            result.text()
                        ),
                        Ok(None) => debug!("Server dropped before its console run finished"),
                        Err(e) => warn!("Server dropped before collecting a failed run: {}", e),
                    }
                }
            })?;
        Ok(rx)
    }

    async fn wait_for(&self, mut rx: oneshot::Receiver<Outcome>) -> Outcome {
        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                warn!("Server run cancelled, engine call left to finish in the background");
                *self.pending.lock() = Some(rx);
                Err(Error::Cancelled)
            }
            _ = deadline(self.timeout) => {
                let timeout = self.timeout.unwrap_or_default();
                warn!("No client served within {:?}", timeout);
                *self.pending.lock() = Some(rx);
                Err(Error::Timeout(timeout))
            }
            outcome = &mut rx => outcome.map_err(|_| Error::WorkerLost)?,
        }
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// One server invocation, run on the worker thread.
///
/// Capture, engine run, restore, drain and reset happen strictly in that
/// order; stdout is back in place before the outcome is handed off.
fn serve_once(shared: &Shared) -> Outcome {
    let handle = shared.handle.lock();
    let engine = handle.engine();
    let test = handle.test();

    if engine.json_output(test) == 0 {
        info!("Running server in console mode");
        if engine.run_server(test) != 0 {
            let errno = engine.errno();
            warn!("Server run failed: {}", engine.strerror(errno));
        }
        engine.reset_test(test);
        return Ok(None);
    }

    let redirect = shared.capture.redirect()?;
    info!("Server waiting for a client on port {}", engine.server_port(test));
    let code = engine.run_server(test);
    let errno = engine.errno();
    let restored = redirect.restore();
    let captured = shared.capture.drain();

    let outcome = match (restored, captured) {
        (Ok(()), Ok(text)) => {
            let result = TestResult::from_run(text, code, || engine.strerror(errno));
            match result.error() {
                Some(message) => warn!("Server run failed: {}", message),
                None => info!("Server run completed"),
            }
            Ok(Some(result))
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    };

    engine.reset_test(test);
    outcome
}
