use crate::breakpoint::{BreakpointKind, BreakpointTable};
use crate::dwarf::{DebugIndex, parse_location};
use crate::error::{Error, Result};
use crate::inferior::Inferior;
use crate::repl::ReplContext;
use anyhow::anyhow;
use capstone::arch::x86::{ArchMode, ArchSyntax};
use capstone::prelude::*;
use nix::sys::{signal::Signal, wait::WaitStatus};
use nix::unistd::Pid;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

const SOURCE_CONTEXT_LINES: u64 = 6;

/// Everything one debugging session owns: the immutable debug index, the
/// breakpoint table, and the traced child (absent once it has exited).
pub struct Debugger {
    index: DebugIndex,
    breakpoints: BreakpointTable,
    inferior: Option<Inferior>,
    target: PathBuf,
    target_args: Vec<String>,
    exit: bool,
}

/// How a resumption ended.
pub enum RunOutcome {
    Exited(Pid),
    Stopped { pc: u64, file: String, line: u64 },
}

/// What happened while re-executing an instruction a trap displaced.
enum TrapOutcome {
    /// The stop was not just past an installed breakpoint.
    NoTrap,
    /// The displaced instruction ran and the trap is armed again.
    Stepped,
    Exited(Pid),
}

impl ReplContext for Debugger {
    fn should_exit(&self) -> bool {
        self.exit
    }
}

impl Debugger {
    /// Builds a session around an already-indexed target and launches it.
    pub fn launch(index: DebugIndex, target: PathBuf, target_args: Vec<String>) -> Result<Self> {
        let inferior = Inferior::launch(&target, &target_args)?;
        let debugger = Debugger {
            index,
            breakpoints: BreakpointTable::default(),
            inferior: Some(inferior),
            target,
            target_args,
            exit: false,
        };
        debugger.warn_if_relocated();
        Ok(debugger)
    }

    /// The address model assumes the text is mapped at its link-time
    /// addresses; warn when the loaded image disagrees (PIE binaries).
    fn warn_if_relocated(&self) {
        let (Some(inferior), Some(probe)) =
            (self.inferior.as_ref(), self.index.first_line_address())
        else {
            return;
        };
        if !inferior.maps_executable_address(&self.target, probe) {
            log::warn!(
                "{} does not map {probe:#x} executable; breakpoint addresses may be wrong \
                 (position-independent executable?)",
                self.target.display()
            );
        }
    }

    fn live_inferior(&self) -> Result<&Inferior> {
        self.inferior.as_ref().ok_or(Error::NoProcess)
    }

    /// The breakpoint address when the last stop was a trap, the raw pc
    /// otherwise. Hardware leaves the pc one past an executed INT3.
    fn adjusted_pc(&self, pc: u64) -> u64 {
        let candidate = pc.wrapping_sub(1);
        if self.breakpoints.find(candidate).is_some_and(|b| b.enabled) {
            candidate
        } else {
            pc
        }
    }

    fn current_location(&self) -> Result<(String, u64)> {
        let pc = self.live_inferior()?.get_pc()?;
        self.index.pc_to_file_line(self.adjusted_pc(pc))
    }

    /// If the inferior sits one past an armed breakpoint, executes the
    /// displaced instruction: restore the byte, rewind the pc, single-step,
    /// re-arm. Afterwards the caller may resume normally.
    fn step_over_displaced_trap(&mut self) -> Result<TrapOutcome> {
        let inferior = self.inferior.as_ref().ok_or(Error::NoProcess)?;
        let pc = inferior.get_pc()?;
        let candidate = pc.wrapping_sub(1);
        if !self.breakpoints.find(candidate).is_some_and(|b| b.enabled) {
            return Ok(TrapOutcome::NoTrap);
        }
        self.breakpoints.disable(inferior, candidate)?;
        inferior.set_pc(candidate)?;
        inferior.single_step()?;
        match inferior.wait()? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                self.breakpoints.enable(inferior, candidate)?;
                Ok(TrapOutcome::Stepped)
            }
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.inferior = None;
                Ok(TrapOutcome::Exited(pid))
            }
            WaitStatus::Stopped(_, signal) => {
                // Re-arm before surfacing the signal so later resumes
                // still trap here.
                self.breakpoints.enable(inferior, candidate)?;
                Err(Error::UnexpectedSignal(signal))
            }
            status => {
                log::warn!("unexpected wait status {status:?}");
                Err(Error::NoProcess)
            }
        }
    }

    /// One raw instruction step. `Some(pid)` means the inferior exited.
    fn raw_single_step(&mut self) -> Result<Option<Pid>> {
        let inferior = self.inferior.as_ref().ok_or(Error::NoProcess)?;
        inferior.single_step()?;
        match inferior.wait()? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(None),
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.inferior = None;
                Ok(Some(pid))
            }
            WaitStatus::Stopped(_, signal) => Err(Error::UnexpectedSignal(signal)),
            status => {
                log::warn!("unexpected wait status {status:?}");
                Err(Error::NoProcess)
            }
        }
    }

    /// `continue`: re-execute a displaced instruction if needed, resume,
    /// and report where the inferior stopped next.
    pub fn continue_execution(&mut self) -> Result<RunOutcome> {
        if let TrapOutcome::Exited(pid) = self.step_over_displaced_trap()? {
            return Ok(RunOutcome::Exited(pid));
        }
        let inferior = self.inferior.as_ref().ok_or(Error::NoProcess)?;
        inferior.cont()?;
        match inferior.wait()? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let pc = self.adjusted_pc(inferior.get_pc()?);
                let (file, line) = self.index.pc_to_file_line(pc)?;
                Ok(RunOutcome::Stopped { pc, file, line })
            }
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                self.inferior = None;
                Ok(RunOutcome::Exited(pid))
            }
            WaitStatus::Stopped(_, signal) => Err(Error::UnexpectedSignal(signal)),
            status => {
                log::warn!("unexpected wait status {status:?}");
                Err(Error::NoProcess)
            }
        }
    }

    /// `step`: advance instruction by instruction, descending into calls,
    /// until the resolved source line changes.
    pub fn step_into_line(&mut self) -> Result<RunOutcome> {
        let (start_file, start_line) = self.current_location()?;
        loop {
            let pc = self.adjusted_pc(self.live_inferior()?.get_pc()?);
            let (file, line) = self.index.pc_to_file_line(pc)?;
            if file != start_file || line != start_line {
                return Ok(RunOutcome::Stopped { pc, file, line });
            }
            match self.step_over_displaced_trap()? {
                TrapOutcome::Exited(pid) => return Ok(RunOutcome::Exited(pid)),
                TrapOutcome::Stepped => {}
                TrapOutcome::NoTrap => {
                    if let Some(pid) = self.raw_single_step()? {
                        return Ok(RunOutcome::Exited(pid));
                    }
                }
            }
        }
    }

    /// `next`: advance one source line without descending into calls.
    /// Marks every known line address of the current function and the
    /// frame's return address with transient breakpoints, resumes until
    /// one is hit or the pc leaves the function, and always removes the
    /// transient breakpoints again.
    pub fn step_over_line(&mut self) -> Result<RunOutcome> {
        let inferior = self.inferior.as_ref().ok_or(Error::NoProcess)?;
        let current = self.adjusted_pc(inferior.get_pc()?);
        let function = self.index.find_function_including_pc(current)?;
        let (low, high) = (function.low_pc, function.high_pc);

        let mut installed = Vec::new();
        let mut install_error = None;
        for (line_pc, _) in self.index.line_addresses_in_range(low, high) {
            // The line we are standing on must not trap us immediately.
            if line_pc == current {
                continue;
            }
            match self.breakpoints.set_internal_breakpoint(inferior, line_pc) {
                Ok(()) => installed.push(line_pc),
                // A user breakpoint there already stops us just as well.
                Err(Error::AlreadyExists(_)) => {}
                Err(err) => {
                    install_error = Some(err);
                    break;
                }
            }
        }

        // A return out of the function never reaches a line breakpoint;
        // trap the return address so the stop lands at the caller site.
        if install_error.is_none() {
            match inferior.return_address() {
                Ok(ret_addr) if ret_addr != current => {
                    match self.breakpoints.set_internal_breakpoint(inferior, ret_addr) {
                        Ok(()) => installed.push(ret_addr),
                        Err(Error::AlreadyExists(_)) => {}
                        // Frameless code has no reliable return slot.
                        Err(err) => {
                            log::warn!("skip return-site breakpoint at {ret_addr:#x}: {err}")
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => log::warn!("read return address: {err}"),
            }
        }

        let result = match install_error {
            Some(err) => Err(err),
            None => self.run_until_breakpoint_or_leave(low, high),
        };
        self.remove_transient_breakpoints(&installed);
        result
    }

    fn run_until_breakpoint_or_leave(&mut self, low: u64, high: u64) -> Result<RunOutcome> {
        loop {
            if let TrapOutcome::Exited(pid) = self.step_over_displaced_trap()? {
                return Ok(RunOutcome::Exited(pid));
            }
            let inferior = self.inferior.as_ref().ok_or(Error::NoProcess)?;
            inferior.cont()?;
            match inferior.wait()? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                    let pc = inferior.get_pc()?;
                    let candidate = pc.wrapping_sub(1);
                    if let Some(bp) = self.breakpoints.find(candidate) {
                        // A transient breakpoint vanishes with this
                        // command, so rewind the pc now; user breakpoints
                        // rewind lazily on the next resume.
                        if bp.kind == BreakpointKind::Internal {
                            inferior.set_pc(candidate)?;
                        }
                        let (file, line) = self.index.pc_to_file_line(candidate)?;
                        return Ok(RunOutcome::Stopped {
                            pc: candidate,
                            file,
                            line,
                        });
                    }
                    if pc < low || pc >= high {
                        let (file, line) = self.index.pc_to_file_line(pc)?;
                        return Ok(RunOutcome::Stopped { pc, file, line });
                    }
                    // A stray trap inside the function; keep going.
                    log::debug!("stray SIGTRAP at {pc:#x} inside [{low:#x}, {high:#x})");
                }
                WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                    self.inferior = None;
                    return Ok(RunOutcome::Exited(pid));
                }
                WaitStatus::Stopped(_, signal) => return Err(Error::UnexpectedSignal(signal)),
                status => {
                    log::warn!("unexpected wait status {status:?}");
                    return Err(Error::NoProcess);
                }
            }
        }
    }

    /// Disables and drops the transient breakpoints a `next` installed, on
    /// success and on error alike. Byte restoration is skipped once the
    /// inferior is gone.
    fn remove_transient_breakpoints(&mut self, pcs: &[u64]) {
        for &pc in pcs {
            if let Some(inferior) = self.inferior.as_ref() {
                if let Err(err) = self.breakpoints.disable(inferior, pc) {
                    log::warn!("restore displaced byte at {pc:#x}: {err}");
                }
            }
            self.breakpoints.clear_internal(pc);
        }
    }

    /// Kills any live inferior, re-execs the target, and re-arms every
    /// user breakpoint in the fresh address space.
    pub fn restart(&mut self) -> Result<Pid> {
        if let Some(inferior) = self.inferior.take() {
            inferior.kill();
        }
        let inferior = Inferior::launch(&self.target, &self.target_args)?;
        self.breakpoints.reinstall(&inferior)?;
        let pid = inferior.pid();
        self.inferior = Some(inferior);
        self.warn_if_relocated();
        Ok(pid)
    }
}

/// Formats a stop or exit for the user, with surrounding source when the
/// file is readable.
fn describe_outcome(outcome: &RunOutcome) -> String {
    match outcome {
        RunOutcome::Exited(pid) => format!("process {pid} exited"),
        RunOutcome::Stopped { pc, file, line } => {
            let mut text = format!("stopped at {file}:{line} ({pc:#x})");
            match render_source(file, *line, SOURCE_CONTEXT_LINES) {
                Ok(source) => {
                    text.push('\n');
                    text.push_str(&source);
                }
                Err(err) => log::warn!("list {file}: {err}"),
            }
            text
        }
    }
}

/// Prints `context` lines around `line` of `file`, marking `line` itself.
fn render_source(file: &str, line: u64, context: u64) -> anyhow::Result<String> {
    let contents = fs::read_to_string(file)?;
    let first = line.saturating_sub(context).max(1);
    let last = line + context;
    let mut out = String::new();
    for (number, text) in contents
        .lines()
        .enumerate()
        .map(|(i, text)| (i as u64 + 1, text))
        .filter(|&(number, _)| first <= number && number <= last)
    {
        let marker = if number == line { "=>" } else { "  " };
        writeln!(out, "{marker} {number:5} {text}")?;
    }
    if out.is_empty() {
        return Err(anyhow!("{file} has no line {line}"));
    }
    Ok(out)
}

// ---- command handlers, wired to the REPL in main -----------------------

pub fn add_breakpoint(args: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let loc = args.get_one::<String>("location").unwrap();
    let (file, line) = parse_location(loc)?;
    let pc = ctx.index.file_line_to_pc(&file, line)?;
    let inferior = ctx.inferior.as_ref().ok_or(Error::NoProcess)?;
    match ctx.breakpoints.set_user_breakpoint(inferior, pc, file, line) {
        Ok(bp) => Ok(format!(
            "breakpoint set at {}:{} ({:#x})",
            bp.file, bp.line, bp.pc
        )),
        Err(Error::AlreadyExists(pc)) => Ok(format!("breakpoint already exists at {pc:#x}")),
        Err(err) => Err(err.into()),
    }
}

pub fn clear_breakpoints(args: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let which = args.get_one::<String>("which").unwrap();
    if which == "all" {
        let removed = ctx.breakpoints.remove_all_user(ctx.inferior.as_ref())?;
        return Ok(format!("removed {removed} breakpoints"));
    }
    let ordinal: usize = which
        .parse()
        .map_err(|_| anyhow!("expected a breakpoint number or \"all\""))?;
    match ctx.breakpoints.remove_user(ctx.inferior.as_ref(), ordinal)? {
        Some(bp) => Ok(format!(
            "removed breakpoint {ordinal} at {}:{} ({:#x})",
            bp.file, bp.line, bp.pc
        )),
        None => Ok(format!("no breakpoint numbered {ordinal}")),
    }
}

pub fn list_breakpoints(args: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let include_internal = args.get_one::<String>("all").is_some_and(|v| v == "all");
    let mut out = String::new();
    for (i, bp) in ctx.breakpoints.user_breakpoints().enumerate() {
        let state = if bp.enabled { "enabled" } else { "disabled" };
        writeln!(out, "{}. {}:{} at {:#x} {state}", i + 1, bp.file, bp.line, bp.pc)?;
    }
    if include_internal {
        for bp in ctx
            .breakpoints
            .all()
            .iter()
            .filter(|b| b.kind == BreakpointKind::Internal)
        {
            writeln!(out, "internal at {:#x}", bp.pc)?;
        }
    }
    if out.is_empty() {
        out.push_str("no breakpoints set");
    }
    Ok(out.trim_end().to_string())
}

pub fn resume(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let outcome = ctx.continue_execution()?;
    Ok(describe_outcome(&outcome))
}

pub fn step_into(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let outcome = ctx.step_into_line()?;
    Ok(describe_outcome(&outcome))
}

pub fn step_over(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let outcome = ctx.step_over_line()?;
    Ok(describe_outcome(&outcome))
}

pub fn list_source(args: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let context = match args.get_one::<String>("range") {
        Some(range) => range.parse()?,
        None => SOURCE_CONTEXT_LINES,
    };
    let (file, line) = match args.get_one::<String>("location") {
        Some(loc) => parse_location(loc)?,
        None => ctx.current_location()?,
    };
    render_source(&file, line, context)
        .map(|s| s.trim_end().to_string())
        .map_err(|err| anyhow!("list {file}: {err}"))
}

pub fn restart(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let pid = ctx.restart()?;
    Ok(format!("process restarted, pid {pid}"))
}

pub fn disassemble(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    let inferior = ctx.live_inferior()?;
    let current = ctx.adjusted_pc(inferior.get_pc()?);
    let (start, end, mut out) = match ctx.index.find_function_including_pc(current) {
        Ok(f) => (f.low_pc, f.high_pc, format!("{}:\n", f.name)),
        Err(_) => (current, current + 32, String::new()),
    };

    let mut code = inferior.read_bytes(start, (end - start) as usize)?;
    // Show the displaced instructions, not our traps.
    for bp in ctx.breakpoints.all() {
        if bp.enabled && start <= bp.pc && bp.pc < end {
            code[(bp.pc - start) as usize] = bp.saved_byte;
        }
    }

    let cs = Capstone::new()
        .x86()
        .mode(ArchMode::Mode64)
        .syntax(ArchSyntax::Att)
        .build()
        .map_err(|err| anyhow!("install disassembler: {err}"))?;
    let instructions = cs
        .disasm_all(&code, start)
        .map_err(|err| anyhow!("disassemble: {err}"))?;
    for ins in instructions.iter() {
        let marker = if ins.address() == current { "=>" } else { "  " };
        writeln!(
            out,
            "{marker} {:#x}: {} {}",
            ins.address(),
            ins.mnemonic().unwrap_or(""),
            ins.op_str().unwrap_or("")
        )?;
    }
    Ok(out.trim_end().to_string())
}

pub fn quit(_: &clap::ArgMatches, ctx: &mut Debugger) -> anyhow::Result<String> {
    if let Some(inferior) = ctx.inferior.take() {
        inferior.kill();
    }
    // Test harnesses set RDBG_TEST to keep the session alive across quit.
    if std::env::var("RDBG_TEST").is_ok_and(|v| !v.is_empty()) {
        return Ok("quit ignored (RDBG_TEST)".to_string());
    }
    ctx.exit = true;
    Ok("bye".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// The debuggee body the controller tests drive. Several statements
    /// on separate lines, no calls surviving to machine code.
    #[inline(never)]
    fn debuggee_scenario(seed: u64) -> u64 {
        let a = std::hint::black_box(seed) + 1;
        let b = std::hint::black_box(a) * 2;
        let c = std::hint::black_box(b) ^ 3;
        std::hint::black_box(c)
    }

    /// Index of the test executable itself, built once. `None` when it
    /// carries no usable debug info.
    fn scenario_index() -> Option<&'static DebugIndex> {
        static INDEX: OnceLock<Option<DebugIndex>> = OnceLock::new();
        INDEX
            .get_or_init(|| {
                let exe = std::env::current_exe().ok()?;
                let index = match DebugIndex::build(&exe) {
                    Ok(index) => index,
                    Err(err) => {
                        eprintln!("skipping controller test: {err}");
                        return None;
                    }
                };
                index.find_function_by_name("debuggee_scenario")?;
                Some(index)
            })
            .as_ref()
    }

    /// Forks a child that runs `debuggee_scenario` and wraps it in a
    /// `Debugger` whose index is slid to the child's load addresses.
    fn scenario_debugger() -> Option<Debugger> {
        let index = scenario_index()?;
        let link_time = index.find_function_by_name("debuggee_scenario")?.low_pc;
        let run_time = debuggee_scenario as fn(u64) -> u64 as usize as u64;
        let index = index.relocated(run_time.wrapping_sub(link_time));

        let inferior = crate::inferior::tests::fork_with(|| {
            debuggee_scenario(7);
        })?;
        Some(Debugger {
            index,
            breakpoints: BreakpointTable::default(),
            inferior: Some(inferior),
            target: std::env::current_exe().expect("current_exe"),
            target_args: vec![],
            exit: false,
        })
    }

    /// Installs a user breakpoint on the scenario function's first line
    /// and continues to it. Returns the function range and the stop pc.
    fn continue_into_scenario(dbg: &mut Debugger) -> (u64, u64, u64) {
        let function = dbg.index.find_function_by_name("debuggee_scenario").unwrap();
        let (low, high) = (function.low_pc, function.high_pc);
        let lines = dbg.index.line_addresses_in_range(low, high);
        assert!(!lines.is_empty(), "scenario function has line records");
        let (bp_pc, _) = lines[0];

        let (file, line) = dbg.index.pc_to_file_line(bp_pc).unwrap();
        let inferior = dbg.inferior.as_ref().unwrap();
        dbg.breakpoints
            .set_user_breakpoint(inferior, bp_pc, file, line)
            .unwrap();

        match dbg.continue_execution().unwrap() {
            RunOutcome::Stopped { pc, .. } => assert_eq!(pc, bp_pc),
            RunOutcome::Exited(_) => panic!("inferior exited before the breakpoint"),
        }
        // The hardware pc stays one past the executed trap.
        assert_eq!(dbg.inferior.as_ref().unwrap().get_pc().unwrap(), bp_pc + 1);
        (low, high, bp_pc)
    }

    #[test]
    fn step_advances_to_a_new_line_inside_the_function() {
        let Some(mut dbg) = scenario_debugger() else { return };
        let (low, high, bp_pc) = continue_into_scenario(&mut dbg);
        let start = dbg.index.pc_to_file_line(bp_pc).unwrap();

        match dbg.step_into_line().unwrap() {
            RunOutcome::Stopped { pc, file, line } => {
                assert_ne!((file, line), start);
                assert!(low <= pc && pc < high, "step left the function");
            }
            RunOutcome::Exited(_) => panic!("inferior exited during a step"),
        }
        if let Some(inferior) = dbg.inferior.take() {
            inferior.kill();
        }
    }

    #[test]
    fn next_walks_to_the_return_site_of_the_function() {
        let Some(mut dbg) = scenario_debugger() else { return };
        let (low, high, _) = continue_into_scenario(&mut dbg);

        let mut return_site = None;
        for _ in 0..16 {
            let outcome = dbg.step_over_line().expect("next");
            assert!(
                dbg.breakpoints
                    .all()
                    .iter()
                    .all(|b| b.kind != BreakpointKind::Internal),
                "transient breakpoints survived a next"
            );
            match outcome {
                RunOutcome::Exited(_) => break,
                RunOutcome::Stopped { pc, .. } => {
                    if pc < low || pc >= high {
                        return_site = Some(pc);
                        break;
                    }
                }
            }
        }
        return_site.expect("next ran past the function instead of stopping at the caller");
        if let Some(inferior) = dbg.inferior.take() {
            inferior.kill();
        }
    }

    #[test]
    fn source_rendering_marks_the_requested_line() {
        let path = std::env::temp_dir().join("rdbg_render_source.txt");
        fs::write(&path, "one\ntwo\nthree\nfour\nfive\n").unwrap();
        let text = render_source(path.to_str().unwrap(), 3, 1).unwrap();
        assert_eq!(text, "       2 two\n=>     3 three\n       4 four\n");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn source_rendering_rejects_lines_past_the_end() {
        let path = std::env::temp_dir().join("rdbg_render_source_short.txt");
        fs::write(&path, "only\n").unwrap();
        assert!(render_source(path.to_str().unwrap(), 10, 2).is_err());
        fs::remove_file(&path).unwrap();
    }
}
