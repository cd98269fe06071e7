use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;

/// Compare the file structure of two directories, ignoring extensions
#[derive(Parser, Debug)]
#[command(name = "base-diff", version)]
struct Cli {
    /// Source directory
    #[arg(short = 's', long)]
    from_dir: PathBuf,

    /// Target directory
    #[arg(short = 't', long)]
    to_dir: PathBuf,

    /// File name to leave out of the comparison
    #[arg(short, long)]
    ignore: Vec<String>,
}

/// Diff lines for the two directories; empty when their structures match
fn compare(cli: &Cli) -> Result<Vec<String>> {
    let ignored: HashSet<String> = cli.ignore.iter().cloned().collect();
    mirror::diff_dirs(&cli.from_dir, &cli.to_dir, &ignored).with_context(|| {
        format!(
            "Failed to compare {} with {}",
            cli.from_dir.display(),
            cli.to_dir.display()
        )
    })
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let lines = compare(&cli)?;

    for line in &lines {
        println!("{}", line);
    }

    Ok(if lines.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
