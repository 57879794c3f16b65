use clap::Parser;

mod cli;
mod host;
mod link;
mod session;

fn main() -> anyhow::Result<()> {
    let args = cli::Args::parse();
    cli::initialize_logging(args.log, args.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "usernet starting");
    session::serve(&args)
}
