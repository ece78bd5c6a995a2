use std::path::PathBuf;

use anyhow::Context;
use structopt::StructOpt;

fn init_logging(opt: &postern::Opt) -> anyhow::Result<()> {
    let level = if opt.verbose {
        tracing::Level::DEBUG
    } else {
        match opt.log_level {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    // POSTERN_LOG overrides the CLI destination; "stderr" forces the tty.
    let dest = std::env::var("POSTERN_LOG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| opt.log_file.clone());
    match dest {
        Some(path) if path.as_os_str() != "stderr" => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening the log file ‘{}’", path.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(move || file.try_clone().expect("cloning the log file handle"))
                .init();
        }
        _ => tracing_subscriber::fmt().with_max_level(level).init(),
    }
    Ok(())
}

fn main() {
    let opt = match postern::Opt::from_iter_safe(std::env::args()) {
        Ok(opt) => opt,
        Err(e) => {
            use structopt::clap::ErrorKind;
            match e.kind {
                ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed => {
                    println!("{}", e.message);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("{}", e.message);
                    std::process::exit(2);
                }
            }
        }
    };

    if let Err(e) = init_logging(&opt) {
        eprintln!("postern: {:#}", e);
        std::process::exit(1);
    }

    // Dropping the sender would stop the server; there is no richer
    // shutdown story than the process dying yet.
    let (_signal, shutdown) = smol::channel::unbounded::<()>();

    if let Err(e) = postern::run(&opt, shutdown) {
        eprintln!("postern: {:#}", e);
        std::process::exit(1);
    }
}
