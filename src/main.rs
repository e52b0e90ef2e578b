use std::path::PathBuf;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use pocketrag::KernelServer;

fn main() -> Result<()> {
    // Log to stderr to keep stdout clean for the wire protocol.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let user_data = PathBuf::from("./UserData");
    let mut server = KernelServer::new(&user_data)?;

    let stdin = std::io::stdin();
    server.run(stdin.lock())?;
    Ok(())
}
