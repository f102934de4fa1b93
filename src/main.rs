mod breakpoint;
mod debugger;
mod dwarf;
mod error;
mod inferior;
mod repl;

use anyhow::Context;
use clap::Arg;
use debugger::Debugger;
use dwarf::DebugIndex;
use repl::Repl;
use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = clap::Command::new("rdbg")
        .about("source-level debugger for native Linux/x86-64 executables")
        .arg(
            Arg::new("binary")
                .required(true)
                .help("the executable to debug"),
        )
        .arg(
            Arg::new("args")
                .num_args(0..)
                .raw(true)
                .help("arguments passed through to the executable"),
        )
        .get_matches();

    // An absolute path keeps execv independent of the working directory
    // and lets the /proc/<pid>/maps check match by pathname.
    let target = PathBuf::from(matches.get_one::<String>("binary").unwrap())
        .canonicalize()
        .context("can't resolve the path to the executable")?;
    let target_args: Vec<String> = matches
        .get_many::<String>("args")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();

    let index = DebugIndex::build(&target)
        .with_context(|| format!("analyze {}", target.display()))?;
    let debugger = Debugger::launch(index, target, target_args)?;

    let mut repl = Repl::new(debugger)
        .add_command(
            clap::Command::new("break")
                .alias("b")
                .arg(
                    Arg::new("location")
                        .required(true)
                        .help("in the form \"source_file:line_number\""),
                )
                .about("set a breakpoint"),
            debugger::add_breakpoint,
        )
        .add_command(
            clap::Command::new("bclear")
                .alias("bc")
                .arg(
                    Arg::new("which")
                        .required(true)
                        .help("breakpoint number or \"all\""),
                )
                .about("clear one or all breakpoints"),
            debugger::clear_breakpoints,
        )
        .add_command(
            clap::Command::new("bl")
                .arg(Arg::new("all").help("\"all\" also shows internal breakpoints"))
                .about("list breakpoints"),
            debugger::list_breakpoints,
        )
        .add_command(
            clap::Command::new("continue")
                .alias("c")
                .about("resume until the next stop or exit"),
            debugger::resume,
        )
        .add_command(
            clap::Command::new("step")
                .alias("s")
                .about("advance one source line, entering calls"),
            debugger::step_into,
        )
        .add_command(
            clap::Command::new("next")
                .alias("n")
                .about("advance one source line within the current function"),
            debugger::step_over,
        )
        .add_command(
            clap::Command::new("list")
                .alias("l")
                .arg(Arg::new("location").help("in the form \"source_file:line_number\""))
                .arg(Arg::new("range").help("how many surrounding lines to print"))
                .about("print source around the current stop or a location"),
            debugger::list_source,
        )
        .add_command(
            clap::Command::new("restart")
                .alias("r")
                .about("re-exec the target and re-arm user breakpoints"),
            debugger::restart,
        )
        .add_command(
            clap::Command::new("disassemble")
                .alias("disass")
                .about("print instructions around the current pc"),
            debugger::disassemble,
        )
        .add_command(
            clap::Command::new("quit")
                .alias("q")
                .about("kill the target process group and exit"),
            debugger::quit,
        );
    repl.run()
}
