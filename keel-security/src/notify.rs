//! Seccomp notification descriptor
//!
//! Kernel structures and ioctls of the user-notification API, plus the
//! [`NotifyChannel`] seam the session broker talks to.

#![allow(unsafe_code)]

use async_trait::async_trait;
use keel_core::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::pipe2;
use serde::{Deserialize, Serialize};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Tell the kernel to run the syscall as if no filter had intercepted it
pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;

/// `struct seccomp_data`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompData {
    /// Syscall number
    pub nr: i32,
    /// Audit architecture
    pub arch: u32,
    /// Instruction pointer
    pub instruction_pointer: u64,
    /// Syscall arguments
    pub args: [u64; 6],
}

/// `struct seccomp_notif`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotif {
    /// Notification id
    pub id: u64,
    /// Notifying task
    pub pid: u32,
    /// Unused, must be zero
    pub flags: u32,
    /// Syscall details
    pub data: SeccompData,
}

/// `struct seccomp_notif_resp`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeccompNotifResp {
    /// Notification id being answered
    pub id: u64,
    /// Syscall return value
    pub val: i64,
    /// Negated errno, or zero
    pub error: i32,
    /// `SECCOMP_USER_NOTIF_FLAG_*`
    pub flags: u32,
}

mod ioctl {
    use super::{SeccompNotif, SeccompNotifResp};

    nix::ioctl_readwrite!(notif_recv, b'!', 0, SeccompNotif);
    nix::ioctl_readwrite!(notif_send, b'!', 1, SeccompNotifResp);
    nix::ioctl_write_ptr!(notif_id_valid, b'!', 2, u64);
}

/// One intercepted syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Kernel-assigned id
    pub id: u64,
    /// Notifying task
    pub pid: u32,
    /// Syscall number
    pub syscall: i32,
    /// Audit architecture
    pub arch: u32,
    /// Instruction pointer
    pub instruction_pointer: u64,
    /// Syscall arguments
    pub args: [u64; 6],
}

impl From<SeccompNotif> for Notification {
    fn from(raw: SeccompNotif) -> Self {
        Self {
            id: raw.id,
            pid: raw.pid,
            syscall: raw.data.nr,
            arch: raw.data.arch,
            instruction_pointer: raw.data.instruction_pointer,
            args: raw.data.args,
        }
    }
}

/// Answer to one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    /// Notification id
    pub id: u64,
    /// Syscall return value
    pub val: i64,
    /// Negated errno, or zero
    pub error: i32,
    /// `SECCOMP_USER_NOTIF_FLAG_*`
    pub flags: u32,
}

impl Response {
    /// Let the syscall run
    #[must_use]
    pub const fn continue_syscall(id: u64) -> Self {
        Self { id, val: 0, error: 0, flags: SECCOMP_USER_NOTIF_FLAG_CONTINUE }
    }

    /// Fake a successful return
    #[must_use]
    pub const fn value(id: u64, val: i64) -> Self {
        Self { id, val, error: 0, flags: 0 }
    }

    /// Fail the syscall with `errno`. Callers pass a validated errno;
    /// the sign is ignored.
    #[must_use]
    pub const fn errno(id: u64, errno: i32) -> Self {
        Self { id, val: 0, error: -errno.saturating_abs(), flags: 0 }
    }
}

impl From<Response> for SeccompNotifResp {
    fn from(response: Response) -> Self {
        Self {
            id: response.id,
            val: response.val,
            error: response.error,
            flags: response.flags,
        }
    }
}

/// Receive side of a notification descriptor, as seen by the session broker
#[async_trait]
pub trait NotifyChannel: Send {
    /// Next notification; `None` once no task uses the filter any more
    ///
    /// Must be cancel safe.
    async fn recv(&mut self) -> Result<Option<Notification>>;

    /// Whether the kernel still waits on notification `id`
    fn id_valid(&self, id: u64) -> Result<bool>;

    /// Answer a notification
    ///
    /// # Errors
    /// Returns [`Error::StaleNotification`] if the kernel dropped it
    fn respond(&mut self, response: Response) -> Result<()>;
}

/// Whether the kernel still waits on notification `id` of `fd`
///
/// # Errors
/// Returns [`Error::System`] for failures other than a stale id
pub fn notification_id_valid(fd: BorrowedFd<'_>, id: u64) -> Result<bool> {
    // SAFETY: `id` outlives the call and the ioctl only reads it
    match unsafe { ioctl::notif_id_valid(fd.as_raw_fd(), &raw const id) } {
        Ok(_) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(Error::System(e)),
    }
}

/// Answer notification `response.id` on `fd`
///
/// # Errors
/// Returns [`Error::StaleNotification`] if the id is no longer valid
pub fn send_response(fd: BorrowedFd<'_>, response: Response) -> Result<()> {
    let mut raw = SeccompNotifResp::from(response);
    // SAFETY: `raw` is a valid, initialized seccomp_notif_resp
    match unsafe { ioctl::notif_send(fd.as_raw_fd(), &raw mut raw) } {
        Ok(_) => Ok(()),
        Err(Errno::ENOENT) => Err(Error::StaleNotification { id: response.id }),
        Err(e) => Err(Error::System(e)),
    }
}

/// Take the next queued notification off `fd`. Blocks if none is queued.
fn recv_notification(fd: BorrowedFd<'_>) -> nix::Result<Notification> {
    let mut raw = SeccompNotif::default();
    // SAFETY: `raw` is a zeroed seccomp_notif, as the kernel requires
    unsafe { ioctl::notif_recv(fd.as_raw_fd(), &raw mut raw) }.map(|_| raw.into())
}

/// Kernel notification descriptor.
///
/// `NOTIF_RECV` has no non-blocking mode, so a dedicated thread owns the
/// receive side: it polls the descriptor, receives and hands each
/// notification over a channel of depth one. Only this process may receive
/// or answer on the descriptor; a copy held elsewhere is for
/// `NOTIF_ID_VALID` only.
///
/// Dropping it denies every notification the thread already received.
#[derive(Debug)]
pub struct KernelNotifyFd {
    fd: Arc<OwnedFd>,
    notifications: mpsc::Receiver<Result<Notification>>,
    deny_errno: i32,
    // Closing the write end wakes the receiver thread
    wake: Option<OwnedFd>,
}

impl KernelNotifyFd {
    /// Take ownership of a listener descriptor and start its receiver
    /// thread. Unanswered notifications are denied with `deny_errno`.
    ///
    /// # Errors
    /// Returns error if the wake pipe or the thread cannot be created
    pub fn new(fd: OwnedFd, deny_errno: i32) -> Result<Self> {
        let fd = Arc::new(fd);
        let (wake_read, wake_write) = pipe2(OFlag::O_CLOEXEC)?;
        let (tx, notifications) = mpsc::channel(1);

        let receiver = ReceiveLoop {
            fd: Arc::clone(&fd),
            wake: wake_read,
            tx,
            deny_errno,
        };
        thread::Builder::new()
            .name("keel-notify".to_string())
            .spawn(move || receiver.run())?;

        Ok(Self {
            fd,
            notifications,
            deny_errno,
            wake: Some(wake_write),
        })
    }
}

struct ReceiveLoop {
    fd: Arc<OwnedFd>,
    wake: OwnedFd,
    tx: mpsc::Sender<Result<Notification>>,
    deny_errno: i32,
}

impl ReceiveLoop {
    fn run(self) {
        loop {
            let mut fds = [
                PollFd::new(self.fd.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let _ = self.tx.blocking_send(Err(Error::System(e)));
                    return;
                }
            }
            let listener = fds[0].revents().unwrap_or_else(PollFlags::empty);
            let woken = fds[1].revents().unwrap_or_else(PollFlags::empty);

            if !woken.is_empty() {
                debug!("Notification receiver stopped");
                return;
            }
            if listener.contains(PollFlags::POLLIN) {
                match recv_notification(self.fd.as_fd()) {
                    Ok(notification) => {
                        if let Err(mpsc::error::SendError(Ok(notification))) =
                            self.tx.blocking_send(Ok(notification))
                        {
                            self.deny(notification.id);
                            return;
                        }
                    }
                    // The task was killed between poll and recv
                    Err(Errno::ENOENT | Errno::EINTR | Errno::EAGAIN) => {}
                    Err(e) => {
                        let _ = self.tx.blocking_send(Err(Error::System(e)));
                        return;
                    }
                }
            } else if listener.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                debug!("Notification descriptor hung up");
                return;
            }
        }
    }

    fn deny(&self, id: u64) {
        if let Err(e) = send_response(self.fd.as_fd(), Response::errno(id, self.deny_errno)) {
            warn!(id, error = %e, "Failed to deny notification after close");
        }
    }
}

impl Drop for KernelNotifyFd {
    fn drop(&mut self) {
        self.notifications.close();
        while let Ok(received) = self.notifications.try_recv() {
            if let Ok(notification) = received {
                let response = Response::errno(notification.id, self.deny_errno);
                if let Err(e) = send_response(self.fd.as_fd(), response) {
                    warn!(id = notification.id, error = %e, "Failed to deny notification");
                }
            }
        }
        drop(self.wake.take());
    }
}

impl AsFd for KernelNotifyFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[async_trait]
impl NotifyChannel for KernelNotifyFd {
    async fn recv(&mut self) -> Result<Option<Notification>> {
        self.notifications.recv().await.transpose()
    }

    fn id_valid(&self, id: u64) -> Result<bool> {
        notification_id_valid(self.as_fd(), id)
    }

    fn respond(&mut self, response: Response) -> Result<()> {
        send_response(self.as_fd(), response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_struct_sizes() {
        assert_eq!(std::mem::size_of::<SeccompData>(), 64);
        assert_eq!(std::mem::size_of::<SeccompNotif>(), 80);
        assert_eq!(std::mem::size_of::<SeccompNotifResp>(), 24);
    }

    #[test]
    fn response_encoding() {
        let resp = SeccompNotifResp::from(Response::errno(7, libc::EPERM));
        assert_eq!(resp, SeccompNotifResp { id: 7, val: 0, error: -libc::EPERM, flags: 0 });

        let resp = SeccompNotifResp::from(Response::continue_syscall(8));
        assert_eq!(resp.flags, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
        assert_eq!(resp.error, 0);

        assert_eq!(Response::value(9, 42).val, 42);
        // Already negative errnos are not flipped back
        assert_eq!(Response::errno(1, -libc::EACCES).error, -libc::EACCES);
        assert_eq!(Response::errno(2, i32::MIN).error, -i32::MAX);
    }

    #[test]
    fn notification_from_raw() {
        let raw = SeccompNotif {
            id: 11,
            pid: 1234,
            flags: 0,
            data: SeccompData {
                nr: 39,
                arch: crate::filter::native_arch(),
                instruction_pointer: 0xdead,
                args: [1, 2, 3, 4, 5, 6],
            },
        };
        let notification = Notification::from(raw);
        assert_eq!(notification.id, 11);
        assert_eq!(notification.syscall, 39);
        assert_eq!(notification.args[5], 6);
    }

    #[tokio::test]
    async fn dropped_descriptor_denies_received_notification() {
        if !crate::support::listener_supported() {
            eprintln!("seccomp listener unsupported, skipping");
            return;
        }

        let (fd_tx, fd_rx) = std::sync::mpsc::channel();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let getppid = libc::SYS_getppid as u32;
        let filtered = thread::spawn(move || {
            crate::filter::set_no_new_privs().unwrap();
            let filter = crate::filter::NotifyFilter::new([getppid]);
            fd_tx.send(filter.compile().unwrap().install_listener().unwrap()).unwrap();
            // SAFETY: getppid has no preconditions
            let ret = unsafe { libc::getppid() };
            (ret, Errno::last())
        });

        let channel = KernelNotifyFd::new(fd_rx.recv().unwrap(), libc::EACCES).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while channel.notifications.is_empty() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        drop(channel);

        assert_eq!(filtered.join().unwrap(), (-1, Errno::EACCES));
    }
}
