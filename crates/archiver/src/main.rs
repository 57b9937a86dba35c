use anyhow::Result;
use archiver::{Config, Supervisor};
use telemetry::{init_structured_logging, LogConfig};
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    init_structured_logging(LogConfig::new("archiver"));

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "startup aborted");
            std::process::exit(1);
        }
    };

    let supervisor = Supervisor::new(config);
    if let Err(e) = supervisor.run(None).await {
        error!(error = %e, "archiver exited with error");
        std::process::exit(1);
    }

    Ok(())
}
