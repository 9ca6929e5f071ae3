// Test double for libiperf shared by the integration tests.
//
// The stub keeps every field the facade touches, records calls that matter
// for the lifecycle invariants, and replays scripted runs. Like the real
// engine it prints its report straight to fd 1, bypassing Rust's stdout.

#![allow(dead_code)]

use iperf3_ffi::{Engine, TestPtr};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ffi::{c_char, CStr};
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// One scripted `run_client` / `run_server` call.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRun {
    pub code: c_int,
    pub stdout: String,
    pub errno: c_int,
    pub delay: Duration,
}

impl ScriptedRun {
    pub fn success(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    pub fn failure(code: c_int, errno: c_int) -> Self {
        Self {
            code,
            errno,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Debug)]
pub struct StubState {
    pub fail_allocation: bool,
    pub allocated: usize,
    pub freed: usize,
    pub defaults_applied: usize,
    pub client_end_calls: usize,
    pub resets: usize,
    pub run_calls: Vec<char>,

    pub role: c_char,
    pub bind_address: Option<String>,
    pub port: c_int,
    pub json_output: c_int,
    pub verbose: c_int,
    pub server_hostname: Option<String>,
    pub protocol_id: c_int,
    pub omit: c_int,
    pub duration: c_int,
    pub rate: u64,
    pub blksize: c_int,
    pub num_streams: c_int,
    pub zerocopy_supported: bool,
    pub zerocopy_calls: Vec<c_int>,
    pub reverse: c_int,

    pub errno: c_int,
    /// Written to `errno` whenever `version()` is read, to catch callers
    /// that look at the error cell too late.
    pub errno_after_version: Option<c_int>,
    pub version: String,
    /// `None`: accessor symbol missing. `Some(text)`: accessor present.
    pub json_accessor: Option<Option<String>>,
    pub runs: VecDeque<ScriptedRun>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            fail_allocation: false,
            allocated: 0,
            freed: 0,
            defaults_applied: 0,
            client_end_calls: 0,
            resets: 0,
            run_calls: Vec::new(),
            role: 0,
            bind_address: None,
            port: 0,
            json_output: 0,
            verbose: 0,
            server_hostname: None,
            protocol_id: 0,
            omit: 0,
            duration: 0,
            rate: 0,
            blksize: 0,
            num_streams: 0,
            zerocopy_supported: false,
            zerocopy_calls: Vec::new(),
            reverse: 0,
            errno: 0,
            errno_after_version: None,
            version: "iperf 3.9".to_string(),
            json_accessor: None,
            runs: VecDeque::new(),
        }
    }
}

#[derive(Default)]
pub struct StubEngine {
    pub state: Mutex<StubState>,
}

impl StubEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state(configure: impl FnOnce(&mut StubState)) -> Arc<Self> {
        let engine = Self::default();
        configure(&mut engine.state.lock());
        Arc::new(engine)
    }

    pub fn script(&self, run: ScriptedRun) {
        self.state.lock().runs.push_back(run);
    }

    fn run(&self, role: char) -> c_int {
        let script = {
            let mut state = self.state.lock();
            state.run_calls.push(role);
            state.runs.pop_front().unwrap_or_else(|| ScriptedRun::failure(-1, 1))
        };

        if !script.delay.is_zero() {
            std::thread::sleep(script.delay);
        }
        write_fd1(&script.stdout);

        if script.code != 0 {
            self.state.lock().errno = script.errno;
        }
        script.code
    }
}

/// Writes to file descriptor 1 the way a C library would.
pub fn write_fd1(text: &str) {
    let mut remaining = text.as_bytes();
    while !remaining.is_empty() {
        let written = unsafe {
            libc::write(
                libc::STDOUT_FILENO,
                remaining.as_ptr() as *const libc::c_void,
                remaining.len(),
            )
        };
        assert!(written > 0, "write to fd 1 failed");
        remaining = &remaining[written as usize..];
    }
}

impl Engine for StubEngine {
    fn new_test(&self) -> Option<TestPtr> {
        let mut state = self.state.lock();
        if state.fail_allocation {
            return None;
        }
        state.allocated += 1;
        // The stub never dereferences the pointer.
        Some(unsafe { TestPtr::from_raw(NonNull::dangling()) })
    }

    fn free_test(&self, _test: TestPtr) {
        self.state.lock().freed += 1;
    }

    fn defaults(&self, _test: TestPtr) -> c_int {
        let mut state = self.state.lock();
        state.defaults_applied += 1;
        // Clobbered so callers have to re-assert the role afterwards.
        state.role = b's' as c_char;
        state.port = 5201;
        state.json_output = 0;
        state.verbose = 0;
        state.protocol_id = libc::SOCK_STREAM;
        state.omit = 0;
        state.duration = 10;
        state.rate = 0;
        state.blksize = 128 * 1024;
        state.num_streams = 1;
        state.reverse = 0;
        0
    }

    fn role(&self, _test: TestPtr) -> c_char {
        self.state.lock().role
    }

    fn set_role(&self, _test: TestPtr, role: c_char) {
        self.state.lock().role = role;
    }

    fn bind_address(&self, _test: TestPtr) -> Option<String> {
        self.state.lock().bind_address.clone()
    }

    fn set_bind_address(&self, _test: TestPtr, address: &CStr) {
        self.state.lock().bind_address = Some(address.to_string_lossy().into_owned());
    }

    fn server_port(&self, _test: TestPtr) -> c_int {
        self.state.lock().port
    }

    fn set_server_port(&self, _test: TestPtr, port: c_int) {
        self.state.lock().port = port;
    }

    fn json_output(&self, _test: TestPtr) -> c_int {
        self.state.lock().json_output
    }

    fn set_json_output(&self, _test: TestPtr, enabled: c_int) {
        self.state.lock().json_output = enabled;
    }

    fn verbose(&self, _test: TestPtr) -> c_int {
        self.state.lock().verbose
    }

    fn set_verbose(&self, _test: TestPtr, enabled: c_int) {
        self.state.lock().verbose = enabled;
    }

    fn server_hostname(&self, _test: TestPtr) -> Option<String> {
        self.state.lock().server_hostname.clone()
    }

    fn set_server_hostname(&self, _test: TestPtr, hostname: &CStr) {
        self.state.lock().server_hostname = Some(hostname.to_string_lossy().into_owned());
    }

    fn protocol_id(&self, _test: TestPtr) -> c_int {
        self.state.lock().protocol_id
    }

    fn set_protocol(&self, _test: TestPtr, protocol_id: c_int) -> c_int {
        self.state.lock().protocol_id = protocol_id;
        0
    }

    fn omit(&self, _test: TestPtr) -> c_int {
        self.state.lock().omit
    }

    fn set_omit(&self, _test: TestPtr, seconds: c_int) {
        self.state.lock().omit = seconds;
    }

    fn duration(&self, _test: TestPtr) -> c_int {
        self.state.lock().duration
    }

    fn set_duration(&self, _test: TestPtr, seconds: c_int) {
        self.state.lock().duration = seconds;
    }

    fn rate(&self, _test: TestPtr) -> u64 {
        self.state.lock().rate
    }

    fn set_rate(&self, _test: TestPtr, bits_per_second: u64) {
        self.state.lock().rate = bits_per_second;
    }

    fn blksize(&self, _test: TestPtr) -> c_int {
        self.state.lock().blksize
    }

    fn set_blksize(&self, _test: TestPtr, blksize: c_int) {
        self.state.lock().blksize = blksize;
    }

    fn num_streams(&self, _test: TestPtr) -> c_int {
        self.state.lock().num_streams
    }

    fn set_num_streams(&self, _test: TestPtr, streams: c_int) {
        self.state.lock().num_streams = streams;
    }

    fn has_zerocopy(&self) -> c_int {
        c_int::from(self.state.lock().zerocopy_supported)
    }

    fn set_zerocopy(&self, _test: TestPtr, enabled: c_int) {
        self.state.lock().zerocopy_calls.push(enabled);
    }

    fn reverse(&self, _test: TestPtr) -> c_int {
        self.state.lock().reverse
    }

    fn set_reverse(&self, _test: TestPtr, enabled: c_int) {
        self.state.lock().reverse = enabled;
    }

    fn run_client(&self, _test: TestPtr) -> c_int {
        self.run('c')
    }

    fn run_server(&self, _test: TestPtr) -> c_int {
        self.run('s')
    }

    fn reset_test(&self, _test: TestPtr) {
        self.state.lock().resets += 1;
    }

    fn client_end(&self, _test: TestPtr) -> c_int {
        self.state.lock().client_end_calls += 1;
        0
    }

    fn errno(&self) -> c_int {
        self.state.lock().errno
    }

    fn strerror(&self, code: c_int) -> String {
        format!("stub error {}", code)
    }

    fn version(&self) -> String {
        let mut state = self.state.lock();
        if let Some(clobbered) = state.errno_after_version {
            state.errno = clobbered;
        }
        state.version.clone()
    }

    fn has_json_output_string(&self) -> bool {
        self.state.lock().json_accessor.is_some()
    }

    fn json_output_string(&self, _test: TestPtr) -> Option<String> {
        self.state.lock().json_accessor.clone().flatten()
    }
}
