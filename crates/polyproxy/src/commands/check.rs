use polyproxy_settings::Config;

use crate::cli::CheckArgs;
use crate::error::CliError;

pub async fn check(args: CheckArgs) -> Result<(), CliError> {
    let mut all_ok = true;

    print!("Config: ");
    let config = match Config::load(&args.config) {
        Ok(config) => {
            println!("OK");
            Some(config)
        }
        Err(e) => {
            println!("FAIL — {e}");
            all_ok = false;
            None
        }
    };

    if let Some(config) = config {
        print!("Structure: ");
        match config.validate() {
            Ok(()) => println!("OK"),
            Err(e) => {
                println!("FAIL — {e}");
                all_ok = false;
            }
        }

        println!("Listen: {}", config.listen);
        println!("Upstream proxies: {}", config.upstreams.len());
        match &config.middle {
            Some(middle) => println!("Middle proxy: {middle}"),
            None => println!("Middle proxy: none"),
        }
        println!("Clusters: {}", config.clusters.len());
        println!("Direct hosts: {}", config.direct.len());
        println!("Block hosts: {}", config.block.len());

        if !config.listen.is_empty() {
            print!("Bind: ");
            match tokio::net::TcpListener::bind(&config.listen).await {
                Ok(listener) => {
                    drop(listener);
                    println!("OK");
                }
                Err(e) => {
                    println!("FAIL — {e}");
                    all_ok = false;
                }
            }
        }
    }

    if !all_ok {
        return Err(CliError::Other("one or more checks failed".to_string()));
    }
    Ok(())
}
