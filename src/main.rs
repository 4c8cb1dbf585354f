use std::fs::OpenOptions;
use std::io::{self, Write};

use clap::Parser;

use salvium_miner::args::Args;
use salvium_miner::supervisor::Supervisor;

/// Duplicates every log line to stderr and to a file, so `--log-file` adds
/// persistence without silencing the console output operators already watch.
struct Tee {
    file: std::fs::File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

fn main() {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.debug {
        builder.filter_level(log::LevelFilter::Debug);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }
    if let Some(path) = &args.log_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(Tee { file })));
            }
            Err(e) => {
                eprintln!("warning: could not open --log-file {}: {e}", path.display());
            }
        }
    }
    builder.init();

    if let Err(e) = args.validate() {
        log::error!("{e}");
        std::process::exit(1);
    }

    if let Err(e) = Supervisor::new(args).run() {
        log::error!("fatal: {e}");
        std::process::exit(1);
    }
}
