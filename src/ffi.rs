//! Runtime binding to the libiperf shared library.
//!
//! The library is opened with `dlopen` and every entry point is resolved up
//! front, so a missing or incompatible library fails at construction with
//! [`Error::Load`] rather than midway through a test. The one symbol that only
//! newer engines export (`iperf_get_test_json_output_string`, 3.1+) is
//! resolved optionally.

use crate::config::LoadOptions;
use crate::engine::{Engine, TestPtr};
use crate::{Error, Result};
use log::{debug, info};
use std::ffi::{c_char, c_void, CStr, CString};
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;

type NewTestFn = unsafe extern "C" fn() -> *mut c_void;
type TestFn = unsafe extern "C" fn(*mut c_void);
type GetIntFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SetIntFn = unsafe extern "C" fn(*mut c_void, c_int);
type SetIntRetFn = unsafe extern "C" fn(*mut c_void, c_int) -> c_int;
type GetCharFn = unsafe extern "C" fn(*mut c_void) -> c_char;
type SetCharFn = unsafe extern "C" fn(*mut c_void, c_char);
type GetStrFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;
type SetStrFn = unsafe extern "C" fn(*mut c_void, *const c_char);
type GetU64Fn = unsafe extern "C" fn(*mut c_void) -> u64;
type SetU64Fn = unsafe extern "C" fn(*mut c_void, u64);
type QueryFn = unsafe extern "C" fn() -> c_int;
type StrerrorFn = unsafe extern "C" fn(c_int) -> *const c_char;

/// An open `dlopen` handle, closed on drop.
struct Library {
    handle: NonNull<c_void>,
}

// SAFETY: dlopen handles may be used and closed from any thread.
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl Library {
    fn open(path: &Path) -> std::result::Result<Self, String> {
        let name = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| "library path contains a NUL byte".to_string())?;
        // SAFETY: `name` is a valid NUL-terminated string for the call.
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        NonNull::new(handle)
            .map(|handle| Self { handle })
            .ok_or_else(last_dl_error)
    }

    fn symbol(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: the handle is open for the lifetime of `self`.
        NonNull::new(unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) })
    }

    fn require(&self, name: &CStr) -> std::result::Result<NonNull<c_void>, String> {
        self.symbol(name)
            .ok_or_else(|| format!("missing symbol {}", name.to_string_lossy()))
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: the handle came from dlopen and is closed exactly once.
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a NUL-terminated thread-local message.
    unsafe {
        let message = libc::dlerror();
        if message.is_null() {
            "unknown dynamic loader error".to_string()
        } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
        }
    }
}

/// Reads a possibly-NULL C string returned by the engine.
///
/// # Safety
///
/// `ptr` must be NULL or point to a NUL-terminated string that stays valid
/// for the duration of the call.
unsafe fn read_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

macro_rules! resolve {
    ($lib:expr, $name:literal, $ty:ty) => {{
        let symbol = $lib.require($name)?;
        // SAFETY: the symbol is the libiperf function of this name, whose C
        // prototype matches `$ty`.
        unsafe { std::mem::transmute::<*mut c_void, $ty>(symbol.as_ptr()) }
    }};
}

/// libiperf loaded at runtime.
pub struct LibIperf {
    new_test: NewTestFn,
    free_test: TestFn,
    defaults: GetIntFn,
    get_role: GetCharFn,
    set_role: SetCharFn,
    get_bind_address: GetStrFn,
    set_bind_address: SetStrFn,
    get_server_port: GetIntFn,
    set_server_port: SetIntFn,
    get_json_output: GetIntFn,
    set_json_output: SetIntFn,
    get_verbose: GetIntFn,
    set_verbose: SetIntFn,
    get_server_hostname: GetStrFn,
    set_server_hostname: SetStrFn,
    get_protocol_id: GetIntFn,
    set_protocol: SetIntRetFn,
    get_omit: GetIntFn,
    set_omit: SetIntFn,
    get_duration: GetIntFn,
    set_duration: SetIntFn,
    get_rate: GetU64Fn,
    set_rate: SetU64Fn,
    get_blksize: GetIntFn,
    set_blksize: SetIntFn,
    get_num_streams: GetIntFn,
    set_num_streams: SetIntFn,
    has_zerocopy: QueryFn,
    set_zerocopy: SetIntFn,
    get_reverse: GetIntFn,
    set_reverse: SetIntFn,
    run_client: GetIntFn,
    run_server: GetIntFn,
    reset_test: TestFn,
    client_end: GetIntFn,
    strerror: StrerrorFn,
    json_output_string: Option<GetStrFn>,
    i_errno: NonNull<c_int>,
    version: NonNull<c_char>,
    // Declared last so the function pointers above never outlive the mapping.
    _lib: Library,
}

// SAFETY: the function pointers and data symbols point into a library that
// stays mapped while `_lib` lives. Per-test calls are serialized by callers.
unsafe impl Send for LibIperf {}
unsafe impl Sync for LibIperf {}

impl LibIperf {
    /// Opens the first library from `options` that loads and exports the
    /// full libiperf surface.
    pub fn load(options: &LoadOptions) -> Result<Self> {
        let candidates = options.candidates();
        let mut reason = String::from("no candidates to try");

        for candidate in &candidates {
            match Self::load_from(candidate) {
                Ok(lib) => {
                    info!(
                        "Loaded {} ({})",
                        candidate.display(),
                        lib.version()
                    );
                    return Ok(lib);
                }
                Err(e) => {
                    debug!("Could not load {}: {}", candidate.display(), e);
                    reason = e;
                }
            }
        }

        Err(Error::Load {
            library: candidates
                .iter()
                .map(|c| c.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            reason,
        })
    }

    fn load_from(path: &Path) -> std::result::Result<Self, String> {
        let lib = Library::open(path)?;

        let json_output_string = lib
            .symbol(c"iperf_get_test_json_output_string")
            // SAFETY: same prototype as the other string getters.
            .map(|symbol| unsafe { std::mem::transmute::<*mut c_void, GetStrFn>(symbol.as_ptr()) });
        if json_output_string.is_none() {
            debug!("iperf_get_test_json_output_string not exported, engine predates 3.1");
        }

        Ok(Self {
            new_test: resolve!(lib, c"iperf_new_test", NewTestFn),
            free_test: resolve!(lib, c"iperf_free_test", TestFn),
            defaults: resolve!(lib, c"iperf_defaults", GetIntFn),
            get_role: resolve!(lib, c"iperf_get_test_role", GetCharFn),
            set_role: resolve!(lib, c"iperf_set_test_role", SetCharFn),
            get_bind_address: resolve!(lib, c"iperf_get_test_bind_address", GetStrFn),
            set_bind_address: resolve!(lib, c"iperf_set_test_bind_address", SetStrFn),
            get_server_port: resolve!(lib, c"iperf_get_test_server_port", GetIntFn),
            set_server_port: resolve!(lib, c"iperf_set_test_server_port", SetIntFn),
            get_json_output: resolve!(lib, c"iperf_get_test_json_output", GetIntFn),
            set_json_output: resolve!(lib, c"iperf_set_test_json_output", SetIntFn),
            get_verbose: resolve!(lib, c"iperf_get_verbose", GetIntFn),
            set_verbose: resolve!(lib, c"iperf_set_verbose", SetIntFn),
            get_server_hostname: resolve!(lib, c"iperf_get_test_server_hostname", GetStrFn),
            set_server_hostname: resolve!(lib, c"iperf_set_test_server_hostname", SetStrFn),
            get_protocol_id: resolve!(lib, c"iperf_get_test_protocol_id", GetIntFn),
            set_protocol: resolve!(lib, c"set_protocol", SetIntRetFn),
            get_omit: resolve!(lib, c"iperf_get_test_omit", GetIntFn),
            set_omit: resolve!(lib, c"iperf_set_test_omit", SetIntFn),
            get_duration: resolve!(lib, c"iperf_get_test_duration", GetIntFn),
            set_duration: resolve!(lib, c"iperf_set_test_duration", SetIntFn),
            get_rate: resolve!(lib, c"iperf_get_test_rate", GetU64Fn),
            set_rate: resolve!(lib, c"iperf_set_test_rate", SetU64Fn),
            get_blksize: resolve!(lib, c"iperf_get_test_blksize", GetIntFn),
            set_blksize: resolve!(lib, c"iperf_set_test_blksize", SetIntFn),
            get_num_streams: resolve!(lib, c"iperf_get_test_num_streams", GetIntFn),
            set_num_streams: resolve!(lib, c"iperf_set_test_num_streams", SetIntFn),
            has_zerocopy: resolve!(lib, c"iperf_has_zerocopy", QueryFn),
            set_zerocopy: resolve!(lib, c"iperf_set_test_zerocopy", SetIntFn),
            get_reverse: resolve!(lib, c"iperf_get_test_reverse", GetIntFn),
            set_reverse: resolve!(lib, c"iperf_set_test_reverse", SetIntFn),
            run_client: resolve!(lib, c"iperf_run_client", GetIntFn),
            run_server: resolve!(lib, c"iperf_run_server", GetIntFn),
            reset_test: resolve!(lib, c"iperf_reset_test", TestFn),
            client_end: resolve!(lib, c"iperf_client_end", GetIntFn),
            strerror: resolve!(lib, c"iperf_strerror", StrerrorFn),
            json_output_string,
            i_errno: lib.require(c"i_errno")?.cast(),
            version: lib.require(c"version")?.cast(),
            _lib: lib,
        })
    }
}

// SAFETY (all calls below): every `TestPtr` handed to these methods comes from
// this engine's `new_test` and is alive until `free_test`, per the contract of
// `TestPtr::from_raw`. Strings passed in are NUL-terminated `CStr`s; libiperf
// copies them before returning.
impl Engine for LibIperf {
    fn new_test(&self) -> Option<TestPtr> {
        let raw = unsafe { (self.new_test)() };
        NonNull::new(raw).map(|ptr| unsafe { TestPtr::from_raw(ptr) })
    }

    fn free_test(&self, test: TestPtr) {
        unsafe { (self.free_test)(test.as_ptr()) }
    }

    fn defaults(&self, test: TestPtr) -> c_int {
        unsafe { (self.defaults)(test.as_ptr()) }
    }

    fn role(&self, test: TestPtr) -> c_char {
        unsafe { (self.get_role)(test.as_ptr()) }
    }

    fn set_role(&self, test: TestPtr, role: c_char) {
        unsafe { (self.set_role)(test.as_ptr(), role) }
    }

    fn bind_address(&self, test: TestPtr) -> Option<String> {
        unsafe { read_c_string((self.get_bind_address)(test.as_ptr())) }
    }

    fn set_bind_address(&self, test: TestPtr, address: &CStr) {
        unsafe { (self.set_bind_address)(test.as_ptr(), address.as_ptr()) }
    }

    fn server_port(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_server_port)(test.as_ptr()) }
    }

    fn set_server_port(&self, test: TestPtr, port: c_int) {
        unsafe { (self.set_server_port)(test.as_ptr(), port) }
    }

    fn json_output(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_json_output)(test.as_ptr()) }
    }

    fn set_json_output(&self, test: TestPtr, enabled: c_int) {
        unsafe { (self.set_json_output)(test.as_ptr(), enabled) }
    }

    fn verbose(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_verbose)(test.as_ptr()) }
    }

    fn set_verbose(&self, test: TestPtr, enabled: c_int) {
        unsafe { (self.set_verbose)(test.as_ptr(), enabled) }
    }

    fn server_hostname(&self, test: TestPtr) -> Option<String> {
        unsafe { read_c_string((self.get_server_hostname)(test.as_ptr())) }
    }

    fn set_server_hostname(&self, test: TestPtr, hostname: &CStr) {
        unsafe { (self.set_server_hostname)(test.as_ptr(), hostname.as_ptr()) }
    }

    fn protocol_id(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_protocol_id)(test.as_ptr()) }
    }

    fn set_protocol(&self, test: TestPtr, protocol_id: c_int) -> c_int {
        unsafe { (self.set_protocol)(test.as_ptr(), protocol_id) }
    }

    fn omit(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_omit)(test.as_ptr()) }
    }

    fn set_omit(&self, test: TestPtr, seconds: c_int) {
        unsafe { (self.set_omit)(test.as_ptr(), seconds) }
    }

    fn duration(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_duration)(test.as_ptr()) }
    }

    fn set_duration(&self, test: TestPtr, seconds: c_int) {
        unsafe { (self.set_duration)(test.as_ptr(), seconds) }
    }

    fn rate(&self, test: TestPtr) -> u64 {
        unsafe { (self.get_rate)(test.as_ptr()) }
    }

    fn set_rate(&self, test: TestPtr, bits_per_second: u64) {
        unsafe { (self.set_rate)(test.as_ptr(), bits_per_second) }
    }

    fn blksize(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_blksize)(test.as_ptr()) }
    }

    fn set_blksize(&self, test: TestPtr, blksize: c_int) {
        unsafe { (self.set_blksize)(test.as_ptr(), blksize) }
    }

    fn num_streams(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_num_streams)(test.as_ptr()) }
    }

    fn set_num_streams(&self, test: TestPtr, streams: c_int) {
        unsafe { (self.set_num_streams)(test.as_ptr(), streams) }
    }

    fn has_zerocopy(&self) -> c_int {
        unsafe { (self.has_zerocopy)() }
    }

    fn set_zerocopy(&self, test: TestPtr, enabled: c_int) {
        unsafe { (self.set_zerocopy)(test.as_ptr(), enabled) }
    }

    fn reverse(&self, test: TestPtr) -> c_int {
        unsafe { (self.get_reverse)(test.as_ptr()) }
    }

    fn set_reverse(&self, test: TestPtr, enabled: c_int) {
        unsafe { (self.set_reverse)(test.as_ptr(), enabled) }
    }

    fn run_client(&self, test: TestPtr) -> c_int {
        unsafe { (self.run_client)(test.as_ptr()) }
    }

    fn run_server(&self, test: TestPtr) -> c_int {
        unsafe { (self.run_server)(test.as_ptr()) }
    }

    fn reset_test(&self, test: TestPtr) {
        unsafe { (self.reset_test)(test.as_ptr()) }
    }

    fn client_end(&self, test: TestPtr) -> c_int {
        unsafe { (self.client_end)(test.as_ptr()) }
    }

    fn errno(&self) -> c_int {
        // SAFETY: `i_errno` is a plain int exported by the library.
        unsafe { self.i_errno.as_ptr().read_volatile() }
    }

    fn strerror(&self, code: c_int) -> String {
        // SAFETY: iperf_strerror returns a pointer to a static buffer.
        unsafe { read_c_string((self.strerror)(code)) }.unwrap_or_default()
    }

    fn version(&self) -> String {
        // SAFETY: `version` is a NUL-terminated char array in the library.
        unsafe { CStr::from_ptr(self.version.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn has_json_output_string(&self) -> bool {
        self.json_output_string.is_some()
    }

    fn json_output_string(&self, test: TestPtr) -> Option<String> {
        let getter = self.json_output_string?;
        unsafe { read_c_string(getter(test.as_ptr())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_library_reports_candidates() {
        let options = LoadOptions::new().with_library("/nonexistent/libiperf-missing.so");
        match LibIperf::load(&options) {
            Err(Error::Load { library, reason }) => {
                assert_eq!(library, "/nonexistent/libiperf-missing.so");
                assert!(!reason.is_empty());
            }
            Err(e) => panic!("expected load error, got {}", e),
            Ok(_) => panic!("expected load error"),
        }
    }

    #[test]
    fn test_read_c_string_null() {
        assert_eq!(unsafe { read_c_string(std::ptr::null()) }, None);
        assert_eq!(
            unsafe { read_c_string(c"iperf 3.9".as_ptr()) },
            Some("iperf 3.9".to_string())
        );
    }
}
