use std::sync::Arc;

use polyproxy_core::{Frontend, Registry};
use polyproxy_settings::Config;

use crate::cli::RunArgs;
use crate::error::CliError;

pub async fn run(args: RunArgs) -> Result<(), CliError> {
    let config = Config::load(&args.config)?;
    config.validate()?;

    let registry = Arc::new(Registry::from_config(&config));

    tokio::spawn(Arc::clone(&registry).cert_checker());
    tokio::spawn(Arc::clone(&registry).house_keeper());

    Frontend::new(registry).run().await?;
    Ok(())
}
