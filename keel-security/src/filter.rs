//! Seccomp user-notification filter compilation and installation
//!
//! The filter checks the audit architecture, hands every listed syscall to
//! user space (`SECCOMP_RET_USER_NOTIF`) and allows everything else.
//! Installing it with `SECCOMP_FILTER_FLAG_NEW_LISTENER` yields the
//! notification descriptor.

#![allow(unsafe_code)]

use keel_core::{Error, ListenerCause, Result};
use nix::errno::Errno;
use std::os::fd::{FromRawFd, OwnedFd};

/// Seccomp return actions
pub mod actions {
    /// Kill the whole process
    pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
    /// Suspend the syscall and notify the listener
    pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
    /// Allow the syscall
    pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
}

/// Audit architecture identifiers
pub mod arch {
    /// x86-64
    pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
    /// i386
    pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
    /// 32-bit ARM
    pub const AUDIT_ARCH_ARM: u32 = 0x4000_0028;
    /// 64-bit ARM
    pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
    /// 64-bit RISC-V
    pub const AUDIT_ARCH_RISCV64: u32 = 0xc000_00f3;
}

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_ulong = 1 << 3;

const BPF_LD_W_ABS: u16 = 0x20;
const BPF_JMP_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

const SECCOMP_DATA_NR_OFFSET: u32 = 0;
const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;

/// Kernel limit on program length
pub const BPF_MAXINSNS: usize = 4096;

/// Audit architecture of the running binary
#[must_use]
pub const fn native_arch() -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        arch::AUDIT_ARCH_X86_64
    }
    #[cfg(target_arch = "x86")]
    {
        arch::AUDIT_ARCH_I386
    }
    #[cfg(target_arch = "arm")]
    {
        arch::AUDIT_ARCH_ARM
    }
    #[cfg(target_arch = "aarch64")]
    {
        arch::AUDIT_ARCH_AARCH64
    }
    #[cfg(target_arch = "riscv64")]
    {
        arch::AUDIT_ARCH_RISCV64
    }
    #[cfg(not(any(
        target_arch = "x86_64",
        target_arch = "x86",
        target_arch = "arm",
        target_arch = "aarch64",
        target_arch = "riscv64"
    )))]
    {
        0
    }
}

/// Classic BPF instruction, laid out like the kernel's `sock_filter`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    /// Opcode
    pub code: u16,
    /// Jump offset if true
    pub jt: u8,
    /// Jump offset if false
    pub jf: u8,
    /// Operand
    pub k: u32,
}

impl Instruction {
    const fn load(offset: u32) -> Self {
        Self { code: BPF_LD_W_ABS, jt: 0, jf: 0, k: offset }
    }

    const fn jump_eq(k: u32, jt: u8, jf: u8) -> Self {
        Self { code: BPF_JMP_JEQ_K, jt, jf, k }
    }

    const fn ret(action: u32) -> Self {
        Self { code: BPF_RET_K, jt: 0, jf: 0, k: action }
    }
}

/// Syscalls to intercept for one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyFilter {
    arch: u32,
    syscalls: Vec<u32>,
}

impl NotifyFilter {
    /// Intercept `syscalls` (native numbers) on the running architecture
    #[must_use]
    pub fn new(syscalls: impl IntoIterator<Item = u32>) -> Self {
        Self::for_arch(native_arch(), syscalls)
    }

    /// Intercept `syscalls` on an explicit audit architecture
    #[must_use]
    pub fn for_arch(arch: u32, syscalls: impl IntoIterator<Item = u32>) -> Self {
        let mut syscalls: Vec<u32> = syscalls.into_iter().collect();
        syscalls.sort_unstable();
        syscalls.dedup();
        Self { arch, syscalls }
    }

    /// Intercepted syscall numbers, sorted
    #[must_use]
    pub fn syscalls(&self) -> &[u32] {
        &self.syscalls
    }

    /// Compile to a BPF program
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the program would exceed
    /// [`BPF_MAXINSNS`]
    pub fn compile(&self) -> Result<BpfProgram> {
        let len = 5 + 2 * self.syscalls.len();
        if len > BPF_MAXINSNS {
            return Err(Error::validation(
                "seccomp filter",
                format!("{} syscalls exceed the BPF program limit", self.syscalls.len()),
            ));
        }

        let mut instructions = Vec::with_capacity(len);
        instructions.push(Instruction::load(SECCOMP_DATA_ARCH_OFFSET));
        instructions.push(Instruction::jump_eq(self.arch, 1, 0));
        instructions.push(Instruction::ret(actions::SECCOMP_RET_KILL_PROCESS));
        instructions.push(Instruction::load(SECCOMP_DATA_NR_OFFSET));
        for nr in &self.syscalls {
            instructions.push(Instruction::jump_eq(*nr, 0, 1));
            instructions.push(Instruction::ret(actions::SECCOMP_RET_USER_NOTIF));
        }
        instructions.push(Instruction::ret(actions::SECCOMP_RET_ALLOW));

        Ok(BpfProgram { instructions })
    }
}

/// Compiled seccomp program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BpfProgram {
    instructions: Vec<Instruction>,
}

impl BpfProgram {
    /// Single-instruction program allowing every syscall
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            instructions: vec![Instruction::ret(actions::SECCOMP_RET_ALLOW)],
        }
    }

    /// Program instructions
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Install the program on the calling thread with listener support and
    /// return the notification descriptor.
    ///
    /// Does not allocate, so it may run in a freshly forked child.
    ///
    /// # Errors
    /// Returns [`Error::ListenerUnsupported`] with
    /// [`ListenerCause::MissingNoNewPrivileges`] if no-new-privileges is not
    /// set, or [`ListenerCause::Kernel`] if the kernel refuses the filter
    pub fn install_listener(&self) -> Result<OwnedFd> {
        if !no_new_privs_set()? {
            return Err(Error::ListenerUnsupported {
                cause: ListenerCause::MissingNoNewPrivileges,
            });
        }

        let len = u16::try_from(self.instructions.len()).map_err(|_| {
            Error::ListenerUnsupported {
                cause: ListenerCause::Kernel(Errno::E2BIG),
            }
        })?;
        let prog = libc::sock_fprog {
            len,
            filter: self.instructions.as_ptr().cast_mut().cast::<libc::sock_filter>(),
        };

        // SAFETY: `prog` points at `self.instructions`, which outlives the call,
        // and `Instruction` has the layout of `sock_filter`.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_NEW_LISTENER,
                &raw const prog,
            )
        };
        if ret < 0 {
            return Err(Error::ListenerUnsupported {
                cause: ListenerCause::Kernel(Errno::last()),
            });
        }

        let fd = i32::try_from(ret).map_err(|_| Error::System(Errno::EBADF))?;
        // SAFETY: the kernel just returned a new descriptor we own
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

/// Set no-new-privileges on the calling thread
///
/// # Errors
/// Returns [`Error::System`] if `prctl` fails
pub fn set_no_new_privs() -> Result<()> {
    nix::sys::prctl::set_no_new_privs()?;
    Ok(())
}

/// Whether no-new-privileges is set on the calling thread
///
/// # Errors
/// Returns [`Error::System`] if `prctl` fails
pub fn no_new_privs_set() -> Result<bool> {
    Ok(nix::sys::prctl::get_no_new_privs()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn compile_layout() {
        let filter = NotifyFilter::for_arch(arch::AUDIT_ARCH_X86_64, [39, 2, 39]);
        let program = filter.compile().unwrap();
        let insns = program.instructions();

        assert_eq!(insns.len(), 5 + 2 * 2);
        assert_eq!(insns[0], Instruction::load(4));
        assert_eq!(insns[1].k, arch::AUDIT_ARCH_X86_64);
        assert_eq!(insns[2].k, actions::SECCOMP_RET_KILL_PROCESS);
        assert_eq!(insns[3], Instruction::load(0));
        // Sorted and deduplicated
        assert_eq!(insns[4], Instruction::jump_eq(2, 0, 1));
        assert_eq!(insns[5].k, actions::SECCOMP_RET_USER_NOTIF);
        assert_eq!(insns[6], Instruction::jump_eq(39, 0, 1));
        assert_eq!(insns.last().unwrap().k, actions::SECCOMP_RET_ALLOW);
    }

    #[test]
    fn oversized_filter_rejected() {
        let filter = NotifyFilter::new(0..3000);
        assert!(matches!(filter.compile(), Err(Error::Validation { .. })));
    }

    #[test]
    fn instruction_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<Instruction>(), std::mem::size_of::<libc::sock_filter>());
        assert_eq!(BpfProgram::allow_all().instructions().len(), 1);
    }

    /// Run `body` in a forked child and return its exit code
    fn in_child(body: impl FnOnce() -> i32) -> i32 {
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let code = body();
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
                WaitStatus::Exited(_, code) => code,
                other => panic!("child ended with {other:?}"),
            },
        }
    }

    #[test]
    fn install_without_no_new_privs_is_misconfiguration() {
        let program = BpfProgram::allow_all();
        let code = in_child(|| {
            if no_new_privs_set().unwrap_or(true) {
                return 0; // inherited from the test harness, nothing to check
            }
            match program.install_listener() {
                Err(Error::ListenerUnsupported { cause }) if cause.is_misconfiguration() => 0,
                _ => 1,
            }
        });
        assert_eq!(code, 0);
    }

    #[test]
    fn install_with_no_new_privs_yields_descriptor() {
        let program = NotifyFilter::new([libc::SYS_getppid as u32]).compile().unwrap();
        let code = in_child(|| {
            if set_no_new_privs().is_err() {
                return 2;
            }
            match program.install_listener() {
                Ok(_fd) => 0,
                Err(Error::ListenerUnsupported { cause: ListenerCause::Kernel(_) }) => 3,
                Err(_) => 1,
            }
        });
        // 3: the kernel lacks listener support, which the check reports too
        assert!(code == 0 || code == 3, "child exited with {code}");
        assert_eq!(code == 0, crate::support::listener_supported());
    }
}
