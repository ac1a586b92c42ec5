use std::path::PathBuf;

use nieuwscrawl::config::Config;
use nieuwscrawl::supervisor;

/// No required arguments; `--config <path>` points at a TOML file and
/// `--verbose` raises log verbosity, overriding the config file's own
/// `verbose` field.
struct Args {
    config_path: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> Args {
    let mut config_path = None;
    let mut verbose = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            "--verbose" => verbose = true,
            _ => {}
        }
    }
    Args { config_path, verbose }
}

#[tokio::main]
async fn main() {
    let args = parse_args();
    let mut config = match Config::load(args.config_path.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            eprintln!("nieuwscrawl: invalid configuration: {err:#}");
            std::process::exit(2);
        }
    };
    if args.verbose {
        config.verbose = true;
    }

    match supervisor::run(config).await {
        Ok(summary) => {
            std::process::exit(summary.exit_code());
        }
        Err(err) => {
            eprintln!("nieuwscrawl: {err:#}");
            std::process::exit(2);
        }
    }
}
