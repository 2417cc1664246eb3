use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::builder::FalseyValueParser;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tmplvm::bytecode::Program;
use tmplvm::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use tmplvm::parser::{self, CompileOptions, Compiled};
use tmplvm::source::{FileLoader, SourceLoader};
use tmplvm::syscall::SyscallTable;
use tmplvm::value::Value;
use tmplvm::vm::{Vm, VmConfig};

const MAGIC: &[u8] = b"TMPLVM";

#[derive(Parser, Debug)]
#[command(name = "tmplvm", version)]
#[command(about = "Compile and render <tmpl_...> templates")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Print errors and warnings as JSON lines on stderr
    #[arg(long, global = true)]
    json_errors: bool,

    /// Disable colored error output
    #[arg(long, global = true, env = "NO_COLOR", value_parser = FalseyValueParser::new())]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a template and render it
    Render {
        template: PathBuf,
        #[command(flatten)]
        compile: CompileArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Compile a template to a bytecode file
    Compile {
        template: PathBuf,
        #[command(flatten)]
        compile: CompileArgs,
        /// Output file (default: the template path with a .tmplc extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Write the program as JSON instead of the binary format
        #[arg(long)]
        json: bool,
    },
    /// Render a compiled bytecode file
    Run {
        program: PathBuf,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Print the instructions of a template or compiled file
    Disasm {
        input: PathBuf,
        #[command(flatten)]
        compile: CompileArgs,
    },
    /// Explain a diagnostic code, e.g. TMPL-P004
    Explain {
        code: Option<String>,
        /// List every known code
        #[arg(long, conflicts_with = "code")]
        list: bool,
    },
}

#[derive(Args, Debug)]
struct CompileArgs {
    /// Directory searched for included templates (repeatable)
    #[arg(short = 'I', long = "include-dir", env = "TMPLVM_INCLUDE_PATH", value_delimiter = ':')]
    include_dirs: Vec<PathBuf>,

    #[arg(long, default_value_t = 32)]
    max_include_depth: usize,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// JSON file with the template data
    #[arg(short, long, conflicts_with = "data_inline")]
    data: Option<PathBuf>,

    /// Template data as a JSON string
    #[arg(long)]
    data_inline: Option<String>,

    /// Instruction limit for one render; 0 disables it
    #[arg(long, default_value_t = 50_000_000)]
    max_steps: u64,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

struct Reporter {
    json: bool,
    color: bool,
}

impl Reporter {
    fn emit(&self, d: &Diagnostic) {
        if self.json {
            eprintln!("{}", json::render(d));
        } else {
            eprint!("{}", AnsiRenderer { use_color: self.color }.render(d));
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("TMPLVM_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    let reporter = Reporter { json: cli.json_errors, color: !cli.no_color && std::io::stderr().is_terminal() };

    match execute(cli.command, &reporter) {
        Ok(()) => ExitCode::SUCCESS,
        Err(d) => {
            reporter.emit(&d);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Command, reporter: &Reporter) -> Result<(), Diagnostic> {
    match command {
        Command::Render { template, compile, exec } => {
            let compiled = compile_template(&template, &compile, reporter)?;
            render(&compiled.program, &exec)
        }
        Command::Compile { template, compile, output, json } => {
            let compiled = compile_template(&template, &compile, reporter)?;
            let output = output.unwrap_or_else(|| template.with_extension("tmplc"));
            let bytes = if json {
                serde_json::to_vec_pretty(&compiled.program)
                    .map_err(|e| Diagnostic::error(format!("cannot serialize program: {e}")))?
            } else {
                compiled.program.to_bytes()
            };
            std::fs::write(&output, bytes).map_err(|e| io_error(&output, e))?;
            tracing::info!(output = %output.display(), instructions = compiled.program.code.len(), "compiled");
            Ok(())
        }
        Command::Run { program, exec } => {
            let program = load_program(&program)?;
            render(&program, &exec)
        }
        Command::Disasm { input, compile } => {
            let bytes = std::fs::read(&input).map_err(|e| io_error(&input, e))?;
            let program = if bytes.starts_with(MAGIC) {
                Program::from_bytes(&bytes).map_err(|e| Diagnostic::from(&e).with_file(input.display().to_string()))?
            } else {
                compile_template(&input, &compile, reporter)?.program
            };
            print!("{}", program.disassemble());
            Ok(())
        }
        Command::Explain { code, list } => {
            if list || code.is_none() {
                for entry in registry::REGISTRY {
                    println!("{}  {}", entry.code, entry.short);
                }
                return Ok(());
            }
            let code = code.unwrap_or_default().to_ascii_uppercase();
            match registry::lookup(&code) {
                Some(entry) => {
                    print!("{}", entry.long);
                    Ok(())
                }
                None => Err(Diagnostic::error(format!("unknown diagnostic code `{code}`"))
                    .with_suggestion("run `tmplvm explain --list` to see every code")),
            }
        }
    }
}

fn compile_template(path: &Path, args: &CompileArgs, reporter: &Reporter) -> Result<Compiled, Diagnostic> {
    let loader = FileLoader::new().with_include_dirs(args.include_dirs.iter().cloned());
    let options = CompileOptions { max_include_depth: args.max_include_depth, ..CompileOptions::default() };
    let name = path.to_string_lossy();
    match parser::compile(&name, &loader, &options) {
        Ok(compiled) => {
            if reporter.json {
                for warning in &compiled.warnings {
                    reporter.emit(&Diagnostic::from(warning));
                }
            }
            Ok(compiled)
        }
        Err(e) => {
            let mut d = Diagnostic::from(&e);
            if e.file == name {
                if let Ok(text) = loader.load(&name) {
                    d = d.with_source(text);
                }
            }
            Err(d)
        }
    }
}

fn load_program(path: &Path) -> Result<Program, Diagnostic> {
    let bytes = std::fs::read(path).map_err(|e| io_error(path, e))?;
    if bytes.starts_with(MAGIC) {
        Program::from_bytes(&bytes).map_err(|e| Diagnostic::from(&e).with_file(path.display().to_string()))
    } else {
        let program: Program = serde_json::from_slice(&bytes)
            .map_err(|e| Diagnostic::error(format!("cannot read program: {e}")).with_file(path.display().to_string()))?;
        program
            .validate()
            .map_err(|e| Diagnostic::from(&e).with_file(path.display().to_string()))?;
        Ok(program)
    }
}

fn load_data(args: &ExecArgs) -> Result<Value, Diagnostic> {
    let text = match (&args.data, &args.data_inline) {
        (Some(path), _) => std::fs::read_to_string(path).map_err(|e| io_error(path, e))?,
        (None, Some(inline)) => inline.clone(),
        (None, None) => return Ok(Value::Hash(Default::default())),
    };
    serde_json::from_str(&text).map_err(|e| Diagnostic::error(format!("invalid JSON data: {e}")))
}

/// Render `program`, writing whatever was produced even when the render fails.
fn render(program: &Program, args: &ExecArgs) -> Result<(), Diagnostic> {
    let data = load_data(args)?;
    let table = SyscallTable::with_builtins();
    let config = VmConfig { max_steps: (args.max_steps > 0).then_some(args.max_steps), ..VmConfig::default() };
    let mut out = String::new();
    let result = Vm::new(program, &table).with_config(config).run(&data, &mut out);

    match &args.output {
        Some(path) => std::fs::write(path, &out).map_err(|e| io_error(path, e))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(out.as_bytes())
                .and_then(|()| stdout.flush())
                .map_err(|e| Diagnostic::error(format!("cannot write output: {e}")))?;
        }
    }
    result.map_err(|e| Diagnostic::from(&e))
}

fn io_error(path: &Path, e: std::io::Error) -> Diagnostic {
    Diagnostic::error(format!("{}: {e}", path.display()))
}
