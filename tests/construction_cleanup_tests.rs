// A test allocated before the capture pipe fails must still be released.
//
// Lowers the process's descriptor limit, so it runs alone in this binary.

mod common;

use common::StubEngine;
use iperf3_ffi::{Client, Error};

fn lowest_free_fd() -> libc::rlim_t {
    let fd = unsafe { libc::dup(libc::STDIN_FILENO) };
    assert!(fd >= 0, "dup failed");
    unsafe { libc::close(fd) };
    fd as libc::rlim_t
}

#[test]
fn test_pipe_failure_frees_allocated_test() {
    let stub = StubEngine::new();

    let mut saved = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut saved) }, 0);

    // No descriptor numbers left, so pipe() fails with EMFILE.
    let lowered = libc::rlimit {
        rlim_cur: lowest_free_fd(),
        rlim_max: saved.rlim_max,
    };
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lowered) }, 0);
    let outcome = Client::with_engine(stub.clone());
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &saved) }, 0);

    assert!(matches!(outcome, Err(Error::Io(_))));
    let state = stub.state.lock();
    assert_eq!(state.allocated, 1);
    assert_eq!(state.client_end_calls, 1);
    assert_eq!(state.freed, 1);
}
