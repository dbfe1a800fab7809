//! CAN Explorer CLI Application
//!
//! Command-line front end for the can-explorer library:
//! - Resolves a route through the JSON route provider
//! - Loads a DBC from the DBC directory
//! - Streams and decodes a window of parts
//! - Optionally moves the window, applies signal edits and saves the DBC
//! - Prints a per-message summary

use anyhow::{Context, Result};
use can_explorer::{
    require_route, DbcStore, ExplorerHandle, FsDbcStore, FsPartSource, HttpPartSource,
    JsonRouteProvider, Orchestrator, PartSource, StoreView,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

mod config;
mod report;

use config::AppConfig;

/// CAN Explorer - Stream and decode recorded CAN logs
#[derive(Parser, Debug)]
#[command(name = "can-explorer")]
#[command(about = "Stream, decode and edit signals of recorded CAN logs", long_about = None)]
#[command(version)]
struct Args {
    /// Route name to load
    #[arg(short, long, value_name = "NAME")]
    route: Option<String>,

    /// DBC name (or file name) in the DBC directory
    #[arg(long, value_name = "NAME")]
    dbc: Option<String>,

    /// First part of the window to show after the initial load
    #[arg(short, long, value_name = "PART")]
    window: Option<u32>,

    /// Path to the routes JSON file
    #[arg(long, value_name = "FILE")]
    routes: Option<PathBuf>,

    /// Directory holding DBC files
    #[arg(long, value_name = "DIR")]
    dbc_dir: Option<PathBuf>,

    /// Save the DBC under this name before exiting
    #[arg(long, value_name = "FILE")]
    save_as: Option<String>,

    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Command-line flags take precedence over the config file
    fn apply_to(&self, config: &mut AppConfig) {
        if let Some(route) = &self.route {
            config.session.route = Some(route.clone());
        }
        if let Some(dbc) = &self.dbc {
            config.session.dbc = Some(dbc.clone());
        }
        if let Some(start) = self.window {
            config.session.window_start = Some(start);
        }
        if let Some(routes) = &self.routes {
            config.sources.routes = routes.clone();
        }
        if let Some(dir) = &self.dbc_dir {
            config.sources.dbc_dir = dir.clone();
        }
        if let Some(save_as) = &self.save_as {
            config.session.save_as = Some(save_as.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Explorer CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using explorer library v{}", can_explorer::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    args.apply_to(&mut config);

    let Some(route_name) = config.session.route.clone() else {
        println!("CAN Explorer - No route specified");
        println!("\nQuick Start:");
        println!("  can-explorer --route <NAME> --dbc <NAME> --routes routes.json --dbc-dir dbc");
        println!("  can-explorer --config config.toml");
        println!("\nUse --help for more options");
        return Ok(());
    };

    run_session(&config, &route_name).await
}

async fn run_session(config: &AppConfig, route_name: &str) -> Result<()> {
    let mut provider = JsonRouteProvider::from_file(&config.sources.routes)
        .with_context(|| format!("Failed to load routes from {:?}", config.sources.routes))?;
    if let Some(base) = &config.sources.part_base {
        provider = provider.with_base_override(base);
    }
    let route = require_route(&provider, route_name)?;

    let dbc_store = Arc::new(FsDbcStore::new(&config.sources.dbc_dir));
    let dbc_name = config.session.dbc.as_deref().unwrap_or(route_name);
    let (filename, dbc) = dbc_store
        .load(dbc_name)
        .with_context(|| format!("Failed to load DBC {:?} from {:?}", dbc_name, config.sources.dbc_dir))?;

    let explorer = config.explorer.clone();
    let source: Arc<dyn PartSource> = if route.url.starts_with("http://") || route.url.starts_with("https://") {
        Arc::new(HttpPartSource::new(explorer.segment_file.clone(), explorer.part_timeout()))
    } else {
        Arc::new(FsPartSource::new(explorer.segment_file.clone()))
    };

    println!("═══════════════════════════════════════════════");
    println!("  CAN Explorer - {}", route_name);
    println!("═══════════════════════════════════════════════\n");

    let orchestrator = Orchestrator::new(route, dbc, filename, explorer)?;
    let handle = ExplorerHandle::spawn(orchestrator, source, dbc_store);

    let result = drive(&handle, config).await;
    handle.shutdown().await;
    let view = result?;

    println!("{}", report::summary(&view));
    Ok(())
}

/// Run the scripted session against a live explorer
async fn drive(handle: &ExplorerHandle, config: &AppConfig) -> Result<StoreView> {
    let mut view = handle.wait_for(StoreView::is_settled).await?;
    log::info!("Initial window {}: {}", view.window, view.chain);

    if let Some(start) = config.session.window_start {
        let epoch = view.generation.epoch;
        handle.change_window(start).await?;
        view = handle
            .wait_for(|v| v.generation.epoch > epoch && v.is_settled())
            .await?;
        log::info!("Window {}: {}", view.window, view.chain);
    }

    for edit in &config.session.edits {
        let key = edit.key();
        let signals = edit.signals();
        if !view.messages.contains_key(&key) {
            log::warn!("{} is not in the loaded window; edit only updates the DBC", key);
        }
        handle.commit_signal_edit(key, signals.clone()).await?;

        if view.messages.contains_key(&key) {
            let names: Vec<&str> = signals.iter().map(|s| s.name.as_str()).collect();
            view = handle
                .wait_for(|v| {
                    v.messages.get(&key).map_or(true, |m| {
                        m.signals.iter().map(|s| s.name.as_str()).eq(names.iter().copied())
                    })
                })
                .await?;
            log::info!("Re-decoded {}", key);
        }
    }

    if let Some(save_as) = &config.session.save_as {
        let saved_at = handle.save_dbc(Some(save_as.clone())).await?;
        log::info!("Saved {} at {}", save_as, saved_at);
    }

    Ok(handle.view())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let args = Args::parse_from([
            "can-explorer",
            "--route",
            "r2",
            "--window",
            "3",
            "--dbc-dir",
            "other",
        ]);
        let mut config = AppConfig::default();
        config.session.route = Some("r1".to_string());
        config.session.dbc = Some("vehicle".to_string());

        args.apply_to(&mut config);
        assert_eq!(config.session.route.as_deref(), Some("r2"));
        assert_eq!(config.session.dbc.as_deref(), Some("vehicle"));
        assert_eq!(config.session.window_start, Some(3));
        assert_eq!(config.sources.dbc_dir, PathBuf::from("other"));
    }

    #[test]
    fn test_verbosity_flags() {
        let args = Args::parse_from(["can-explorer", "-vv", "-q"]);
        assert_eq!(args.verbose, 2);
        assert!(args.quiet);
    }
}
