use std::path::{Path, PathBuf};

use xproxy_settings::{ConfigLoader, PolicyFiles, XProxyConfig};

use crate::cli::{ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub async fn config(
    args: crate::cli::ConfigArgs,
    cwd: PathBuf,
) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => init(global, &cwd).await,
        ConfigSubcommand::Show { format } => show(format, &cwd).await,
    }
}

async fn init(global: bool, cwd: &Path) -> Result<(), CliError> {
    let path = if global {
        ConfigLoader::global_config_path()
    } else {
        ConfigLoader::project_config_path(cwd)
    };

    if path.exists() {
        return Err(CliError::Other(format!(
            "Config file already exists: {}",
            path.display()
        )));
    }

    let starter = XProxyConfig::starter();
    starter.save(&path)?;
    println!("Created config: {}", path.display());

    // Policy paths are relative to the directory the proxy runs in.
    let files = PolicyFiles::from_settings(&starter.policy);
    let files = PolicyFiles::new(cwd.join(files.blocklist_path), cwd.join(files.redirects_path));
    for created in files.write_defaults()? {
        println!("Created policy file: {}", created.display());
    }
    Ok(())
}

async fn show(format: OutputFormat, cwd: &Path) -> Result<(), CliError> {
    let config = ConfigLoader::load(cwd, None)?.resolved();
    match format {
        OutputFormat::Toml => {
            let toml = config.to_toml()?;
            print!("{toml}");
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| CliError::Other(format!("JSON serialization failed: {e}")))?;
            println!("{json}");
        }
    }
    Ok(())
}
