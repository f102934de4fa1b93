use crate::error::{Error, Result};
use nix::{
    sys::{
        personality::{self, Persona},
        ptrace,
        signal::{Signal, kill},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, execv, fork, setpgid},
};
use std::{ffi::CString, path::Path};

/// The instruction used for software breakpoints on x86-64.
pub const INT3: u8 = 0xCC;

/// A traced child process. All ptrace requests are issued from the thread
/// that forked it, which is the only control thread in the debugger.
pub struct Inferior {
    pid: Pid,
}

impl Inferior {
    /// Forks and execs `path` under tracing, in its own process group and
    /// with address-space randomization disabled so text addresses match
    /// the DWARF. Returns once the child has stopped at its exec trap.
    pub fn launch(path: &Path, args: &[String]) -> Result<Self> {
        match unsafe { fork() }.map_err(Error::Ptrace)? {
            ForkResult::Child => {
                ptrace::traceme().expect("traceme");
                let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
                let _ = personality::set(Persona::ADDR_NO_RANDOMIZE);
                let program = CString::new(path.to_str().unwrap_or_default()).unwrap();
                let mut argv = vec![program.clone()];
                argv.extend(args.iter().map(|a| CString::new(a.as_str()).unwrap()));
                execv(&program, &argv).expect("execv");
                unreachable!()
            }
            ForkResult::Parent { child: pid } => {
                let inferior = Inferior { pid };
                match inferior.wait()? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                        log::debug!("launched {} as pid {pid}", path.display());
                        Ok(inferior)
                    }
                    WaitStatus::Stopped(_, signal) => Err(Error::UnexpectedSignal(signal)),
                    status => {
                        log::warn!("child did not reach its exec trap: {status:?}");
                        Err(Error::NoProcess)
                    }
                }
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn get_pc(&self) -> Result<u64> {
        Ok(ptrace::getregs(self.pid)?.rip)
    }

    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = ptrace::getregs(self.pid)?;
        regs.rip = pc;
        ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// Return address of the current frame, read through the frame
    /// pointer. Meaningful once the prologue has set up an rbp frame.
    pub fn return_address(&self) -> Result<u64> {
        let regs = ptrace::getregs(self.pid)?;
        self.peek_text(regs.rbp.wrapping_add(8))
    }

    /// Reads one word of the inferior's text at `pc`.
    pub fn peek_text(&self, pc: u64) -> Result<u64> {
        let word = ptrace::read(self.pid, pc as usize as ptrace::AddressType)?;
        Ok(word as u64)
    }

    /// Writes one word of the inferior's text at `pc`.
    pub fn poke_text(&self, pc: u64, word: u64) -> Result<()> {
        ptrace::write(self.pid, pc as usize as ptrace::AddressType, word as i64)?;
        Ok(())
    }

    /// Replaces the byte at `pc`, returning the byte it displaced. The
    /// surrounding word is preserved by a read-modify-write.
    pub fn write_byte(&self, pc: u64, byte: u8) -> Result<u8> {
        let word = self.peek_text(pc)?;
        let displaced = (word & 0xff) as u8;
        self.poke_text(pc, (word & !0xff) | byte as u64)?;
        Ok(displaced)
    }

    pub fn read_byte(&self, pc: u64) -> Result<u8> {
        Ok((self.peek_text(pc)? & 0xff) as u8)
    }

    /// Reads `len` bytes of text starting at `pc`, one word at a time.
    pub fn read_bytes(&self, pc: u64, len: usize) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(len);
        let mut addr = pc;
        while bytes.len() < len {
            let word = self.peek_text(addr)?;
            let take = (len - bytes.len()).min(8);
            bytes.extend_from_slice(&word.to_le_bytes()[..take]);
            addr += 8;
        }
        Ok(bytes)
    }

    /// Executes exactly one instruction. The caller must `wait` afterwards.
    pub fn single_step(&self) -> Result<()> {
        ptrace::step(self.pid, None)?;
        Ok(())
    }

    /// Resumes the inferior until its next stop. The caller must `wait`.
    pub fn cont(&self) -> Result<()> {
        ptrace::cont(self.pid, None)?;
        Ok(())
    }

    /// Blocks until the inferior stops or exits.
    pub fn wait(&self) -> Result<WaitStatus> {
        Ok(waitpid(self.pid, None)?)
    }

    /// Kills the inferior's whole process group and reaps it.
    pub fn kill(&self) {
        let group = Pid::from_raw(-self.pid.as_raw());
        if let Err(err) = kill(group, Signal::SIGKILL) {
            log::warn!("kill process group of {}: {err}", self.pid);
            return;
        }
        while let Ok(status) = waitpid(self.pid, None) {
            if matches!(
                status,
                WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _)
            ) {
                break;
            }
        }
    }

    /// True when `pc` falls inside an executable mapping of `path` in the
    /// inferior's address space. Used at launch to notice binaries loaded
    /// away from their link-time addresses.
    pub fn maps_executable_address(&self, path: &Path, pc: u64) -> bool {
        let Ok(maps) = rsprocmaps::from_pid(self.pid.as_raw()) else {
            return true;
        };
        maps.into_iter().flatten().any(|map| {
            matches!(&map.pathname, rsprocmaps::Pathname::Path(p) if Path::new(p) == path)
                && map.permissions.executable
                && map.address_range.begin <= pc
                && pc < map.address_range.end
        })
    }
}
