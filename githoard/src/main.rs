use clap::Parser;
use githoard::cli::{Args, Command};
use githoard::{commands, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = Args::parse();
    match args.command {
        Command::Download(args) => commands::download(args).await,
        Command::Update(args) => commands::update(args).await,
    }
}
