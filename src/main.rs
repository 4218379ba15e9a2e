use anyhow::{Context, Result};

use gpibmux::cli::{self, cleanup::run_cleanups};

fn main() -> Result<()> {
    env_logger::init();
    let matches = cli::parse_args();

    ctrlc::set_handler(|| {
        log::info!("Interrupted, closing adapters");
        run_cleanups();
        std::process::exit(130);
    })
    .context("cannot install Ctrl-C handler")?;

    cli::actions::run(&matches)
}
