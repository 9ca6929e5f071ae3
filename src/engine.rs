//! Capability interface to the measurement engine.
//!
//! [`Engine`] is the narrow surface this crate needs from libiperf. The
//! production implementation is [`LibIperf`](crate::ffi::LibIperf), which
//! resolves the symbols from the shared library at runtime; tests plug in
//! their own implementation. Every method mirrors one native entry point and
//! keeps its fixed-width C types, so the typed policies live one level up in
//! [`TestConfig`](crate::TestConfig).

use crate::config::Role;
use crate::{Error, Result};
use log::debug;
use std::ffi::{c_char, c_void, CStr};
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::sync::Arc;

/// Opaque pointer to an engine-owned `struct iperf_test`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPtr(NonNull<c_void>);

impl TestPtr {
    /// Wraps a test pointer produced by an engine.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by the same engine's
    /// [`Engine::new_test`] implementation and must stay valid until it is
    /// passed to [`Engine::free_test`]. Engines that never dereference the
    /// pointer (test doubles) may hand out any non-null value.
    pub unsafe fn from_raw(ptr: NonNull<c_void>) -> Self {
        Self(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Operations the engine exposes to the host layer.
///
/// All scalar operations are synchronous. `run_client` and `run_server` block
/// the calling thread for the whole test. The engine is not reentrant: callers
/// must serialize access per test, which [`TestHandle`] users do with a mutex.
pub trait Engine: Send + Sync {
    /// `iperf_new_test`; `None` when the engine returned NULL.
    fn new_test(&self) -> Option<TestPtr>;
    /// `iperf_free_test`
    fn free_test(&self, test: TestPtr);
    /// `iperf_defaults`
    fn defaults(&self, test: TestPtr) -> c_int;

    fn role(&self, test: TestPtr) -> c_char;
    fn set_role(&self, test: TestPtr, role: c_char);

    /// `None` when the engine has no bind address set.
    fn bind_address(&self, test: TestPtr) -> Option<String>;
    fn set_bind_address(&self, test: TestPtr, address: &CStr);

    fn server_port(&self, test: TestPtr) -> c_int;
    fn set_server_port(&self, test: TestPtr, port: c_int);

    fn json_output(&self, test: TestPtr) -> c_int;
    fn set_json_output(&self, test: TestPtr, enabled: c_int);

    fn verbose(&self, test: TestPtr) -> c_int;
    fn set_verbose(&self, test: TestPtr, enabled: c_int);

    fn server_hostname(&self, test: TestPtr) -> Option<String>;
    fn set_server_hostname(&self, test: TestPtr, hostname: &CStr);

    fn protocol_id(&self, test: TestPtr) -> c_int;
    /// `set_protocol`
    fn set_protocol(&self, test: TestPtr, protocol_id: c_int) -> c_int;

    fn omit(&self, test: TestPtr) -> c_int;
    fn set_omit(&self, test: TestPtr, seconds: c_int);

    fn duration(&self, test: TestPtr) -> c_int;
    fn set_duration(&self, test: TestPtr, seconds: c_int);

    fn rate(&self, test: TestPtr) -> u64;
    fn set_rate(&self, test: TestPtr, bits_per_second: u64);

    fn blksize(&self, test: TestPtr) -> c_int;
    fn set_blksize(&self, test: TestPtr, blksize: c_int);

    fn num_streams(&self, test: TestPtr) -> c_int;
    fn set_num_streams(&self, test: TestPtr, streams: c_int);

    /// `iperf_has_zerocopy`; nonzero when sendfile() is available.
    fn has_zerocopy(&self) -> c_int;
    fn set_zerocopy(&self, test: TestPtr, enabled: c_int);

    fn reverse(&self, test: TestPtr) -> c_int;
    fn set_reverse(&self, test: TestPtr, enabled: c_int);

    fn run_client(&self, test: TestPtr) -> c_int;
    fn run_server(&self, test: TestPtr) -> c_int;
    /// `iperf_reset_test`
    fn reset_test(&self, test: TestPtr);
    /// `iperf_client_end`
    fn client_end(&self, test: TestPtr) -> c_int;

    /// Reads the process-wide `i_errno` cell.
    fn errno(&self) -> c_int;
    /// `iperf_strerror`
    fn strerror(&self, code: c_int) -> String;
    /// Reads the process-wide `version` buffer, e.g. "iperf 3.1.3".
    fn version(&self) -> String;

    /// Whether `iperf_get_test_json_output_string` exists in this build.
    fn has_json_output_string(&self) -> bool {
        false
    }

    /// `iperf_get_test_json_output_string`; `None` when the symbol is missing
    /// or the engine returned NULL.
    fn json_output_string(&self, _test: TestPtr) -> Option<String> {
        None
    }
}

/// Scoped owner of one engine test.
///
/// The test is allocated and reset to defaults in [`TestHandle::new`] and
/// released exactly once in `Drop`. The pointer never leaves this type except
/// as a borrowed [`TestPtr`] handed to engine calls.
pub struct TestHandle {
    engine: Arc<dyn Engine>,
    test: TestPtr,
    role: Role,
}

// SAFETY: the engine test is plain heap state with no thread affinity. The
// handle is only ever reached through the `Mutex` in `TestConfig`, so at most
// one thread touches it at a time.
unsafe impl Send for TestHandle {}

impl TestHandle {
    /// Allocates a test, applies engine defaults and fixes its role.
    pub fn new(engine: Arc<dyn Engine>, role: Role) -> Result<Self> {
        let test = engine
            .new_test()
            .ok_or_else(|| Error::Engine("iperf_new_test returned NULL".to_string()))?;

        // From here on `Drop` frees the test, even if a later step fails.
        let handle = Self { engine, test, role };
        handle.engine.defaults(test);
        handle.engine.set_role(test, role.as_char());
        debug!("Allocated iperf test {:p} with role {}", test.as_ptr(), role);
        Ok(handle)
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    pub fn test(&self) -> TestPtr {
        self.test
    }

    /// Role fixed at construction.
    pub fn role(&self) -> Role {
        self.role
    }
}

impl Drop for TestHandle {
    fn drop(&mut self) {
        if self.role == Role::Client {
            self.engine.client_end(self.test);
        }
        self.engine.free_test(self.test);
        debug!("Released iperf test {:p}", self.test.as_ptr());
    }
}
