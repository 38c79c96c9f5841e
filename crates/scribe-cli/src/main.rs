use clap::Parser;
use scribe_cli::{run, Cli};
use scribe_logging::{LogConfig, SubscriberBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Console logs go to stderr so command output stays clean
    let _guard = SubscriberBuilder::new()
        .with_config(LogConfig::development())
        .with_level(cli.global.log_level.clone())
        .init();

    let mut stdout = std::io::stdout();
    run(cli, &mut stdout).await
}
