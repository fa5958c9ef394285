//! Eagletun - a multi-protocol tunneling proxy

use std::path::PathBuf;
use std::process::exit;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use eagletun::app::Service;
use eagletun::error::{Error, Result};
use eagletun::Config;

fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(Error::EarlyExit) => exit(0),
        Err(e) => {
            eprintln!("error: {}", e);
            exit(1);
        }
    };

    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set tracing subscriber");

    exit(run(args));
}

fn run(args: Args) -> i32 {
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };

    info!("eagletun v{} starting", env!("CARGO_PKG_VERSION"));

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return 1;
        }
    };

    match args.check_target {
        Some(target) => match rt.block_on(check(&config, &target)) {
            Ok(()) => {
                println!("check {}: ok", target);
                0
            }
            Err(e) => {
                println!("check {}: {}", target, e);
                1
            }
        },
        None => serve(&rt, config),
    }
}

fn serve(rt: &tokio::runtime::Runtime, config: Config) -> i32 {
    let service = match Service::from_config(config) {
        Ok(service) => service,
        Err(e) => {
            error!("{}", e);
            return 1;
        }
    };
    match rt.block_on(service.run()) {
        // The server only leaves its loop through an interrupt
        Ok(()) => 130,
        Err(Error::Io(e)) => {
            error!("listen failed: {}", e);
            2
        }
        Err(e) => {
            error!("{}", e);
            1
        }
    }
}

/// Run one diagnostic and report.
async fn check(config: &Config, target: &str) -> Result<()> {
    match target {
        "relay" => {
            let service = Service::from_config(config.clone())?;
            let client = service.et_client().ok_or(Error::NoRelayer)?;
            client.probe().await?;
            Ok(())
        }
        other => Err(Error::Config(format!("unknown check target: {}", other))),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        Some(path) => Config::load(path),
        None => {
            info!("no config file specified, using local proxy defaults");
            let mut config = Config::default();
            config.enable_socks = true;
            config.enable_http = true;
            config.enable_et = true;
            Ok(config)
        }
    }
}

/// Command line arguments
struct Args {
    config: Option<PathBuf>,
    check_target: Option<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let argv: Vec<String> = std::env::args().collect();
        let mut config = None;
        let mut check_target = None;

        let mut i = 1;
        if argv.get(1).map(String::as_str) == Some("check") {
            let target = argv.get(2).cloned().ok_or_else(|| {
                Error::Config("check needs a target, e.g. `eagletun check relay`".into())
            })?;
            check_target = Some(target);
            i = 3;
        }

        while i < argv.len() {
            match argv[i].as_str() {
                "-c" | "--config" => {
                    if i + 1 < argv.len() {
                        config = Some(PathBuf::from(&argv[i + 1]));
                        i += 1;
                    }
                }
                "-v" | "--version" => {
                    print_version();
                    return Err(Error::EarlyExit);
                }
                "-h" | "--help" => {
                    print_help();
                    return Err(Error::EarlyExit);
                }
                arg if !arg.starts_with('-') && config.is_none() => {
                    // Positional argument: treat as config file
                    config = Some(PathBuf::from(arg));
                }
                _ => {}
            }
            i += 1;
        }

        Ok(Self {
            config,
            check_target,
        })
    }
}

fn print_help() {
    println!(
        r#"Eagletun - a multi-protocol tunneling proxy

USAGE:
    eagletun [check <target>] [OPTIONS] [CONFIG]

SUBCOMMANDS:
    check relay             Probe the configured relayer (handshake + auth)

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    eagletun -c eagle.conf
    eagletun eagle.conf
    eagletun check relay -c eagle.conf

EXIT CODES:
    0    normal / check passed
    1    configuration error or failed check
    2    listen error
    130  interrupted
"#
    );
}

fn print_version() {
    println!("eagletun v{}", env!("CARGO_PKG_VERSION"));
}
