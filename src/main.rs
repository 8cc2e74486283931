//! The compiler executable: reads preprocessed C from a file or standard
//! input and writes QBE intermediate language to standard output or `-o`.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qbecc", about = "C11 compiler front-end emitting QBE intermediate language")]
struct Cli {
  /// Print the token stream and exit
  #[arg(short = 'E')]
  tokens: bool,

  /// Write output to FILE instead of standard output
  #[arg(short = 'o', value_name = "FILE")]
  output: Option<PathBuf>,

  /// Input file; `-` or no argument reads standard input
  input: Option<PathBuf>,
}

fn run(cli: &Cli) -> qbecc::Result<()> {
  let (name, src) = match &cli.input {
    Some(path) if path.as_os_str() != "-" => {
      (path.display().to_string(), fs::read_to_string(path)?)
    }
    _ => {
      let mut src = String::new();
      io::stdin().read_to_string(&mut src)?;
      ("<stdin>".to_string(), src)
    }
  };
  let mut out: Box<dyn Write> = match &cli.output {
    Some(path) => Box::new(fs::File::create(path)?),
    None => Box::new(io::stdout().lock()),
  };
  if cli.tokens {
    qbecc::dump_tokens(&name, &src, &mut out)?;
  } else {
    qbecc::compile(&name, &src, &mut out)?;
  }
  out.flush()?;
  Ok(())
}

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(io::stderr)
    .init();
  let cli = Cli::parse();
  match run(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("{e}");
      ExitCode::FAILURE
    }
  }
}
