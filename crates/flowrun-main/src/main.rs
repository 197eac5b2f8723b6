use clap::Parser as _;
use flowrun_main::{Cli, Result, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level, cli.other_log_level, cli.log_file.as_deref())?;

    cli.execute().await?;
    Ok(())
}
