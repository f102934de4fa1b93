use nix::sys::signal::Signal;

/// Errors of the debugger core. Every command is a transaction: any of
/// these aborts the current command but never the debugger itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("can't find .debug_{0} or .zdebug_{0} section")]
    MissingDebugSection(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("object file parsing error: {0}")]
    ElfParse(#[from] object::Error),
    #[error("dwarf parsing error: {0}")]
    DwarfParse(#[from] gimli::Error),
    #[error("wrong location format, should be filename:lineno")]
    BadLocation,
    #[error("no address for source line {0}:{1}")]
    NotFoundSourceLine(String, u64),
    #[error("no function contains address {0:#x}")]
    NotFoundFunction(u64),
    #[error("no line information for address {0:#x}")]
    InvalidPc(u64),
    #[error("breakpoint already exists at {0:#x}")]
    AlreadyExists(u64),
    #[error("ptrace syscall error: {0}")]
    Ptrace(#[from] nix::Error),
    #[error("no process is being debugged")]
    NoProcess,
    #[error("unexpected stop signal {0}")]
    UnexpectedSignal(Signal),
}

impl Error {
    /// Fatal errors stop the whole debugger, the rest abort one command.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MissingDebugSection(_) | Error::ElfParse(_) | Error::DwarfParse(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
