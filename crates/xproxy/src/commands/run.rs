use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use xproxy_engine::{PolicySource, PolicyStore, ProxyConfig, ProxyError, ProxyServer};
use xproxy_settings::{ConfigLoader, PolicyFiles, ProxySettings, XProxyConfig};

use crate::cli::RunArgs;
use crate::console::{run_console, stdin_lines, ConsoleExit};
use crate::error::CliError;

/// Policy tables read from the JSON files on every load.
struct FilePolicySource {
    files: PolicyFiles,
}

impl PolicySource for FilePolicySource {
    fn load_blocklist(&self) -> xproxy_engine::Result<Vec<String>> {
        self.files
            .load_blocklist()
            .map_err(|e| ProxyError::PolicyLoad(e.to_string()))
    }

    fn load_redirects(&self) -> xproxy_engine::Result<Vec<(String, String)>> {
        self.files
            .load_redirects()
            .map_err(|e| ProxyError::PolicyLoad(e.to_string()))
    }
}

pub async fn run(args: RunArgs, cwd: PathBuf) -> Result<(), CliError> {
    // 1. Load and merge config.
    // --no-config skips global/project config files but --config <extra> still applies.
    let extra = args.extra_config.as_deref();
    let mut config = match (args.no_config, extra) {
        (false, _) => ConfigLoader::load(&cwd, extra)?,
        (true, Some(path)) => XProxyConfig::load(path)?,
        (true, None) => XProxyConfig::default(),
    };

    // 2. CLI flags override every file layer.
    apply_overrides(&mut config, &args);

    // 3. Initial policy load. Failures are logged by the store and leave
    // that table empty.
    let files = policy_files(&config, &cwd);
    info!(
        blocklist = %files.blocklist_path.display(),
        redirects = %files.redirects_path.display(),
        "Loading policy"
    );
    let store = Arc::new(PolicyStore::load(Arc::new(FilePolicySource { files })));
    info!(
        blocked = store.blocklist().len(),
        redirects = store.redirects().len(),
        "Policy loaded"
    );

    // 4. Start the proxy.
    let proxy_config = build_proxy_config(&config.proxy);
    let mut handle = ProxyServer::new(proxy_config, Arc::clone(&store))?
        .start()
        .await?;
    println!("XProxy listening on {}", handle.proxy_addr());

    // 5. Serve until the proxy stops, the operator exits, or Ctrl-C.
    let console = async {
        if args.no_console {
            return std::future::pending::<Result<(), CliError>>().await;
        }
        println!("Type 'help' for available commands.");
        match run_console(stdin_lines(), tokio::io::stdout(), store).await? {
            ConsoleExit::Exit => Ok(()),
            ConsoleExit::Eof => {
                info!("Console input closed, proxy keeps running");
                std::future::pending().await
            }
        }
    };

    tokio::select! {
        result = handle.wait() => {
            result?;
            info!("Proxy stopped");
        }
        result = console => {
            result?;
            info!("Exit requested from console");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    handle.shutdown().await?;
    info!("Proxy shut down");
    Ok(())
}

fn apply_overrides(config: &mut XProxyConfig, args: &RunArgs) {
    if args.port.is_some() {
        config.proxy.port = args.port;
    }
    if args.bind.is_some() {
        config.proxy.bind_address = args.bind;
    }
    if args.max_connections.is_some() {
        config.proxy.max_connections = args.max_connections;
    }
    if args.blocklist.is_some() {
        config.policy.blocklist_path = args.blocklist.clone();
    }
    if args.redirects.is_some() {
        config.policy.redirects_path = args.redirects.clone();
    }
}

/// Policy file locations, with relative paths resolved against `cwd`.
fn policy_files(config: &XProxyConfig, cwd: &Path) -> PolicyFiles {
    let files = PolicyFiles::from_settings(&config.policy);
    PolicyFiles::new(cwd.join(files.blocklist_path), cwd.join(files.redirects_path))
}

fn build_proxy_config(settings: &ProxySettings) -> ProxyConfig {
    ProxyConfig {
        bind_addr: std::net::SocketAddr::new(settings.bind_address(), settings.port()),
        backlog: settings.backlog(),
        socket_buffer_size: settings.socket_buffer_bytes(),
        chunk_size: settings.chunk_bytes(),
        io_timeout: Duration::from_secs(settings.io_timeout_secs()),
        connect_timeout: Duration::from_secs(settings.connect_timeout_secs()),
        max_connections: settings.max_connections,
    }
}
