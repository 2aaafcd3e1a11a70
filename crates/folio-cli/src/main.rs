use clap::Parser;

mod args;
mod commands;
mod logging;

use args::Cli;
use folio_core::FolioError;

/// Exit code for failures that are not engine errors (bad input files, I/O).
const EXIT_USAGE: i32 = 1;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let code = match commands::dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<FolioError>())
        .map_or(EXIT_USAGE, FolioError::exit_code)
}
