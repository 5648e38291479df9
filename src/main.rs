//! Hunter Compiler CLI
//!
//! The `huntc` command is the entry point for the Hunter compiler.

use clap::Parser;
use hunter::{ir, parser};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "huntc")]
#[command(version = hunter::VERSION)]
#[command(about = "The Hunter language compiler", long_about = None)]
struct Cli {
    /// Hunter source file to compile
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Write the textual IR to this path instead of stdout
    #[arg(long, value_name = "PATH")]
    output_ir: Option<PathBuf>,

    /// Print the parsed AST (for debugging)
    #[arg(long)]
    emit_ast: bool,
}

fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let source = fs::read_to_string(&cli.input)
        .map_err(|e| miette::miette!("Failed to read file: {}", e))?;

    let mut program = parser::parse(&source)
        .map_err(|e| miette::miette!("Parser error: {}", e))?;

    // Imports are resolved relative to the source file's directory.
    let base_dir = cli.input.parent().unwrap_or(Path::new("."));
    parser::resolve_imports(&mut program, base_dir)
        .map_err(|e| miette::miette!("Import error: {}", e))?;

    if cli.emit_ast {
        println!("=== AST ===");
        println!("{:#?}", program);
    }

    let module_name = cli
        .input
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let module = ir::generate(&program, &module_name)
        .map_err(|e| miette::miette!("Codegen error: {}", e))?;

    let text = ir::print_module(&module);
    match &cli.output_ir {
        Some(path) => {
            fs::write(path, text)
                .map_err(|e| miette::miette!("Failed to write IR to {}: {}", path.display(), e))?;
            println!("Wrote {}", path.display());
        }
        None => {
            println!("{}", text);
        }
    }

    Ok(())
}
