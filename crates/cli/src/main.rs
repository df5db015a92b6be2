mod cli;
mod logging;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Create, Status, Throttle};

command_enum! {
    (Create, Create),
    (Status, Status),
    (Throttle, Throttle),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guards = logging::init_logging(args.log_level, args.log_dir.as_deref());

    let ctx = cli::op::OpContext::new(args.config_path, args.password);

    match args.command.execute(&ctx).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            Err(e.into())
        }
    }
}
