use polyproxy_settings::Config;

use crate::cli::ConfigArgs;
use crate::error::CliError;

pub async fn config(args: ConfigArgs) -> Result<(), CliError> {
    let config = Config::load(&args.config)?;
    print!("{}", config.dump());
    Ok(())
}
