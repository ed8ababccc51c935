//! The cot compiler driver.

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use cot_codegen::{Arch, Context, Diagnostics};
use cot_object::ObjectModule;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "cotc", about = "Compiler for the cot language", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a source file to a relocatable object file.
    Compile {
        /// The source file.
        source: PathBuf,
        /// Where to write the object file.
        #[arg(short, long)]
        output: PathBuf,
        /// Target triple; defaults to the host.
        #[arg(long)]
        target: Option<String>,
        /// Print the symbols the object leaves undefined.
        #[arg(long)]
        print_undefined: bool,
    },
}

fn main() {
    init_logging();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Compile {
            source,
            output,
            target,
            print_undefined,
        } => match compile(&source, &output, target.as_deref(), print_undefined) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("error: {err:#}");
                1
            }
        },
    };
    std::process::exit(code);
}

/// `COT_DEBUG=lower,ssa,regalloc,emit` turns on per-phase tracing; it maps
/// onto module-filtered logging.
fn init_logging() {
    let mut builder = env_logger::Builder::from_default_env();
    if let Ok(phases) = std::env::var("COT_DEBUG") {
        for phase in phases.split(',') {
            let module = match phase.trim() {
                "lower" => "cot_frontend::lower",
                "ssa" => "cot_codegen::ssa",
                "passes" => "cot_codegen::ssa::passes",
                "regalloc" => "cot_codegen::regalloc",
                "emit" => "cot_codegen::isa",
                "object" => "cot_object",
                "all" | "" => "",
                other => {
                    eprintln!("warning: unknown COT_DEBUG phase `{other}`");
                    continue;
                }
            };
            if module.is_empty() {
                builder.filter_level(log::LevelFilter::Trace);
            } else {
                builder.filter_module(module, log::LevelFilter::Trace);
            }
        }
    }
    builder.init();
}

fn pick_arch(target: Option<&str>) -> Result<Arch> {
    let triple = match target {
        Some(t) => t
            .parse::<target_lexicon::Triple>()
            .map_err(|e| anyhow::anyhow!("bad target triple `{t}`: {e}"))?,
        None => target_lexicon::Triple::host(),
    };
    match triple.architecture {
        target_lexicon::Architecture::Aarch64(_) => Ok(Arch::Aarch64),
        target_lexicon::Architecture::X86_64 => Ok(Arch::X64),
        other => bail!("unsupported target architecture `{other}`"),
    }
}

fn compile(
    source: &PathBuf,
    output: &PathBuf,
    target: Option<&str>,
    print_undefined: bool,
) -> Result<()> {
    let arch = pick_arch(target)?;
    let text = std::fs::read_to_string(source)
        .with_context(|| format!("reading {}", source.display()))?;

    let diag = Diagnostics::new();
    let (checked, ir_funcs) = cot_frontend::compile_source(&text, &diag)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if diag.has_errors() {
        for d in diag.take() {
            eprintln!(
                "{}:{}: {}: {}",
                source.display(),
                render_loc(&text, d.loc),
                d.severity,
                d.message
            );
        }
        bail!("compilation failed");
    }

    let mut module = ObjectModule::new(arch);
    let mut globals: Vec<_> = checked.globals.iter().collect();
    globals.sort_by(|a, b| a.0.cmp(b.0));
    for (name, &ty) in globals {
        module.add_global(name, checked.registry.size_of(ty));
    }

    let ctx = Context::new(arch);
    for f in &ir_funcs {
        if f.is_extern {
            continue;
        }
        let string_syms: Vec<String> = f
            .strings
            .iter()
            .map(|s| module.intern_literal(s))
            .collect();
        let compiled = ctx
            .compile(f, &checked.registry, &string_syms)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        module.add_function(compiled);
    }

    if print_undefined {
        for name in module.undefined_symbols() {
            println!("undefined: {name}");
        }
    }

    let bytes = module.finish().context("writing object")?;
    std::fs::write(output, bytes)
        .with_context(|| format!("writing {}", output.display()))?;
    log::info!("wrote {}", output.display());
    Ok(())
}

/// Render a byte offset as file:line:column.
fn render_loc(text: &str, loc: cot_codegen::SourceLoc) -> String {
    let off = loc.bits() as usize;
    let mut line = 1;
    let mut col = 1;
    for (i, c) in text.char_indices() {
        if i >= off {
            break;
        }
        if c == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    format!("{line}:{col}")
}
