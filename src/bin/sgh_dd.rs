use std::process::exit;

use anyhow::Error;

use sgh_dd::collection::Collection;
use sgh_dd::error::DdError;
use sgh_dd::options::USAGE;
use sgh_dd::{Invocation, Options};

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("SGH_DD_LOG", level))
        .write_style(env_logger::WriteStyle::Never)
        .format_timestamp_millis()
        .init();
}

fn run(mut opts: Options) -> Result<i32, Error> {
    opts.signal_listener = true;
    let json = opts.json;

    let coll = Collection::new(opts)?;
    let stats = sgh_dd::run(&coll)?;

    if json {
        println!("{}", stats.to_json()?);
    } else {
        eprint!("{}", stats);
    }
    Ok(stats.exit_status)
}

fn main() {
    let opts = match Options::parse_args(std::env::args().skip(1)) {
        Ok(Invocation::Run(opts)) => opts,
        Ok(Invocation::Help) => {
            print!("{}", USAGE);
            exit(0);
        }
        Ok(Invocation::Version) => {
            println!("sgh_dd {}", env!("CARGO_PKG_VERSION"));
            exit(0);
        }
        Err(err) => {
            eprintln!("sgh_dd: {}", err);
            eprintln!("try 'sgh_dd --help' for more information");
            exit(DdError::exit_code_of(&err));
        }
    };

    init_logger(opts.verbose);

    match run(*opts) {
        Ok(status) => exit(status),
        Err(err) => {
            eprintln!("sgh_dd: {}", err);
            exit(DdError::exit_code_of(&err));
        }
    }
}
