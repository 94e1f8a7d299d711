//! Kernel feature checks
//!
//! Each check answers yes or no without side effects on the calling
//! process. Checks that must install a filter do so in a forked child.

#![allow(unsafe_code)]

use keel_core::{Error, Result};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use tracing::debug;

use crate::filter::{set_no_new_privs, BpfProgram};

/// Feature names understood by [`check_feature`]
pub const FEATURES: [&str; 3] = ["seccomp-listener", "open_tree", "move_mount"];

/// Whether seccomp listener descriptors are available.
///
/// A child sets no-new-privileges and installs a single-instruction
/// always-allow filter with the listener flag; exit status 0 means
/// supported.
#[must_use]
pub fn listener_supported() -> bool {
    // Built before forking: the child must not allocate
    let program = BpfProgram::allow_all();

    // SAFETY: the child only calls prctl, seccomp and _exit
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            let code = match set_no_new_privs().and_then(|()| program.install_listener()) {
                Ok(_fd) => 0,
                Err(_) => 1,
            };
            // SAFETY: leaves the forked child without running atexit handlers
            unsafe { libc::_exit(code) }
        }
        Ok(ForkResult::Parent { child }) => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(code, "Listener check finished");
                    return code == 0;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(?signal, "Listener check killed");
                    return false;
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => {
                    debug!(error = %e, "Listener check wait failed");
                    return false;
                }
            }
        },
        Err(e) => {
            debug!(error = %e, "Listener check fork failed");
            false
        }
    }
}

/// Whether the kernel implements a syscall. Called with invalid arguments,
/// a present syscall fails with anything but `ENOSYS`.
fn syscall_present(nr: libc::c_long) -> bool {
    // SAFETY: every argument is invalid, so the kernel rejects the call
    // before touching memory
    let ret = unsafe {
        libc::syscall(
            nr,
            -1_i32,
            std::ptr::null::<libc::c_char>(),
            -1_i32,
            std::ptr::null::<libc::c_char>(),
            u32::MAX,
        )
    };
    ret >= 0 || Errno::last() != Errno::ENOSYS
}

/// Check a named kernel feature
///
/// # Errors
/// Returns [`Error::Validation`] for an unknown feature name
pub fn check_feature(name: &str) -> Result<bool> {
    let supported = match name {
        "seccomp-listener" => listener_supported(),
        "open_tree" => syscall_present(libc::SYS_open_tree),
        "move_mount" => syscall_present(libc::SYS_move_mount),
        other => {
            return Err(Error::validation(
                "feature",
                format!("unknown feature {other:?}, expected one of {}", FEATURES.join(", ")),
            ));
        }
    };

    debug!(feature = name, supported, "Checked kernel feature");
    Ok(supported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_feature_is_an_error() {
        let err = check_feature("time-travel").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(err.to_string().contains("seccomp-listener"));
    }

    #[test]
    fn checks_do_not_affect_caller() {
        let before = crate::filter::no_new_privs_set().unwrap();
        for feature in FEATURES {
            check_feature(feature).unwrap();
        }
        assert_eq!(crate::filter::no_new_privs_set().unwrap(), before);
    }

    #[test]
    fn listener_check_is_stable() {
        assert_eq!(listener_supported(), listener_supported());
    }
}
