//! logbeat entry point: parses CLI and starts the async application runtime.
//! The main function is intentionally thin and delegates to the runtime in `app`.

use anyhow::Result;
use logbeat::{app, cli, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let options = cli::parse();
    telemetry::init(options.verbose);
    app::run(options).await
}
