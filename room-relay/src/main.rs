use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use room_relay::{
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing(command: &Command) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    // Client stdout is the chat transcript; keep logs off it.
    let _ = match command {
        Command::Serve(_) => builder.try_init(),
        Command::Client(_) => builder.with_writer(std::io::stderr).try_init(),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.command);

    match cli.command {
        Command::Serve(args) => {
            let config = args.config();
            config.validate()?;

            let listener = TcpListener::bind(args.listen).await?;
            let server = Server::new(listener, config);
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run_until_signal().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}
