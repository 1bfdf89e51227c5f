//! swconf: command-line front end for the softwire control plane.
//!
//! # Usage
//!
//! ```text
//! swconf run lwaftr.conf --name lwaftr
//! swconf config get lwaftr /softwire-config/name
//! swconf config get --schema=ietf-softwire lwaftr /softwire-config/binding/br
//! swconf config add lwaftr /softwire-config/binding-table/softwire '{ ipv4 1.2.3.4; psid 1; ... }'
//! swconf config listen lwaftr /softwire-config
//! swconf query lwaftr ipv4
//! swconf generate-binding-table 193.5.1.100 10 fc00::100 fc00:1:2:3:4:5:0:7e 1
//! ```

mod client;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use swconf_core::bindgen::{self, BindingTableParams};
use swconf_core::client::parse_counters;
use swconf_core::daemon::{self, Daemon};
use swconf_core::instance::SyntheticFactory;
use swconf_core::protocol::{Request, Verb};
use swconf_core::rundir::RunDir;
use swconf_core::schema::softwire::COUNTERS;
use swconf_core::settings::DaemonSettings;


/// swconf - softwire (lwAFTR) control plane
#[derive(Parser, Debug)]
#[command(name = "swconf")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level filter (trace, debug, info, warn, error); falls back to RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Directory holding leader sockets (overrides SWCONF_RUN_DIR)
    #[arg(long, global = true)]
    run_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a leader in the foreground
    Run {
        /// Initial configuration document
        conf: PathBuf,

        /// Publish the leader under this name
        #[arg(long)]
        name: Option<String>,

        /// YAML settings file
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Query or change a running leader's configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Print a leader's aggregated counters
    Query {
        /// Print every counter name and exit
        #[arg(long)]
        list_all: bool,

        /// Leader pid or name (defaults to the only running leader)
        target: Option<String>,

        /// Only counters whose name contains this text
        filter: Option<String>,
    },

    /// Print a generated binding table
    GenerateBindingTable {
        ipv4: Ipv4Addr,
        num_ipv4s: u32,
        br_address: Ipv6Addr,
        b4: Ipv6Addr,
        psid_len: u8,
        shift: Option<u8>,
    },
}

#[derive(Args, Debug)]
struct Addressed {
    /// Schema the path and values are written in
    #[arg(long)]
    schema: Option<String>,

    /// Leader pid or name
    target: String,

    path: String,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the configuration at a path
    Get(Addressed),

    /// Print operational state at a path
    GetState(Addressed),

    /// Replace the value at a path
    Set {
        #[command(flatten)]
        at: Addressed,
        value: String,
    },

    /// Add an entry to a list
    Add {
        #[command(flatten)]
        at: Addressed,
        value: String,
    },

    /// Remove an entry or optional leaf
    Remove(Addressed),

    /// Stream committed changes under a path
    Listen {
        #[arg(long)]
        schema: Option<String>,
        target: String,
        #[arg(default_value = "/")]
        path: String,
    },
}


fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("swconf: {:#}", e);
            ExitCode::FAILURE
        }
    }
}


fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::try_new(l).unwrap_or_else(|_| EnvFilter::new("warn")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}


fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            conf,
            name,
            settings,
        } => run_leader(cli.run_dir, &conf, name, settings),
        Commands::Config(cmd) => run_config(&run_dir(cli.run_dir), cmd),
        Commands::Query {
            list_all,
            target,
            filter,
        } => {
            if list_all {
                for name in COUNTERS {
                    println!("{}", name);
                }
                return Ok(ExitCode::SUCCESS);
            }
            query(&run_dir(cli.run_dir), target.as_deref(), filter.as_deref())
        }
        Commands::GenerateBindingTable {
            ipv4,
            num_ipv4s,
            br_address,
            b4,
            psid_len,
            shift,
        } => {
            let table = bindgen::generate(&BindingTableParams {
                ipv4,
                num_ipv4s,
                br_address,
                b4,
                psid_len,
                shift,
            })?;
            print!("{}", table);
            Ok(ExitCode::SUCCESS)
        }
    }
}


/// Settings file, then environment, then command-line flags.
fn load_settings(path: Option<&Path>, run_dir: Option<PathBuf>) -> Result<DaemonSettings> {
    let base = match path {
        Some(p) => DaemonSettings::load(p)?,
        None => DaemonSettings::default(),
    };
    let mut settings = base.from_process_env();
    if let Some(dir) = run_dir {
        settings.run_dir = dir;
    }
    Ok(settings)
}


fn run_dir(flag: Option<PathBuf>) -> RunDir {
    let mut settings = DaemonSettings::default().from_process_env();
    if let Some(dir) = flag {
        settings.run_dir = dir;
    }
    RunDir::new(settings.run_dir)
}


fn run_leader(
    run_dir: Option<PathBuf>,
    conf: &Path,
    name: Option<String>,
    settings_path: Option<PathBuf>,
) -> Result<ExitCode> {
    let mut settings = load_settings(settings_path.as_deref(), run_dir)?;
    if name.is_some() {
        settings.name = name;
    }
    let text = std::fs::read_to_string(conf)
        .with_context(|| format!("cannot read configuration {}", conf.display()))?;

    daemon::install_signal_handlers();
    let leader = Daemon::start(settings, &text, Arc::new(SyntheticFactory))
        .context("leader failed to start")?;
    eprintln!("swconf: leader listening on {}", leader.socket_path().display());

    let exit = leader.run();
    if let Some(reason) = exit.fatal {
        eprintln!("swconf: fatal: {}", reason);
        return Ok(ExitCode::FAILURE);
    }
    if !exit.report.stragglers.is_empty() {
        eprintln!(
            "swconf: {} worker(s) did not stop within the grace period",
            exit.report.stragglers.len()
        );
    }
    for (id, message) in &exit.report.panicked {
        eprintln!("swconf: worker {} panicked: {}", id, message);
    }
    if exit.report.is_abnormal() {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}


fn addressed(verb: Verb, at: &Addressed) -> Request {
    let req = Request::new(0, verb).with_path(&at.path);
    match &at.schema {
        Some(s) => req.with_schema(s),
        None => req,
    }
}


fn run_config(run_dir: &RunDir, cmd: ConfigCommands) -> Result<ExitCode> {
    let (target, req) = match &cmd {
        ConfigCommands::Get(at) => (&at.target, addressed(Verb::Get, at)),
        ConfigCommands::GetState(at) => (&at.target, addressed(Verb::GetState, at)),
        ConfigCommands::Set { at, value } => (&at.target, addressed(Verb::Set, at).with_value(value)),
        ConfigCommands::Add { at, value } => (&at.target, addressed(Verb::Add, at).with_value(value)),
        ConfigCommands::Remove(at) => (&at.target, addressed(Verb::Remove, at)),
        ConfigCommands::Listen {
            schema,
            target,
            path,
        } => {
            let mut req = Request::new(0, Verb::Listen).with_path(path);
            if let Some(s) = schema {
                req = req.with_schema(s);
            }
            return listen(run_dir, target, req);
        }
    };
    let mut conn = client::connect(run_dir, Some(target), Some(client::REQUEST_TIMEOUT))?;
    client::one_shot(&mut conn, req)
}


fn listen(run_dir: &RunDir, target: &str, req: Request) -> Result<ExitCode> {
    let mut conn = client::connect(run_dir, Some(target), Some(client::REQUEST_TIMEOUT))?;
    let resp = conn.request(req)?;
    if !resp.is_ok() {
        return Ok(client::report(&resp));
    }
    conn.set_timeout(None)?;
    loop {
        if let Some(note) = conn.next_notification()? {
            println!("{}", serde_json::to_string(&note)?);
        }
    }
}


fn query(run_dir: &RunDir, target: Option<&str>, filter: Option<&str>) -> Result<ExitCode> {
    let mut conn = client::connect(run_dir, target, Some(client::REQUEST_TIMEOUT))?;
    let resp = conn.request(Request::new(0, Verb::GetState).with_path("/softwire-state"))?;
    if !resp.is_ok() {
        return Ok(client::report(&resp));
    }
    println!("lwAFTR operational counters");
    for (name, value) in parse_counters(resp.value.as_deref().unwrap_or_default()) {
        if filter.map_or(true, |f| name.contains(f)) {
            println!("{}: {}", name, value);
        }
    }
    Ok(ExitCode::SUCCESS)
}


#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("swconf").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn config_get_takes_schema_flag() {
        let cli = parse(&["config", "get", "--schema=ietf-softwire", "lwaftr", "/softwire-config"]);
        match cli.command {
            Commands::Config(ConfigCommands::Get(at)) => {
                assert_eq!(at.schema.as_deref(), Some("ietf-softwire"));
                assert_eq!(at.target, "lwaftr");
                let req = addressed(Verb::Get, &at);
                assert_eq!(req.path.as_deref(), Some("/softwire-config"));
                assert_eq!(req.schema.as_deref(), Some("ietf-softwire"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn config_set_value_follows_path() {
        let cli = parse(&["config", "set", "7", "/softwire-config/name", "other"]);
        match cli.command {
            Commands::Config(ConfigCommands::Set { at, value }) => {
                assert_eq!(at.target, "7");
                assert_eq!(value, "other");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn listen_path_defaults_to_root() {
        let cli = parse(&["config", "listen", "lwaftr"]);
        match cli.command {
            Commands::Config(ConfigCommands::Listen { path, .. }) => assert_eq!(path, "/"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn generate_binding_table_shift_is_optional() {
        let cli = parse(&[
            "generate-binding-table",
            "193.5.1.100",
            "10",
            "fc00::100",
            "fc00:1:2:3:4:5:0:7e",
            "1",
        ]);
        match cli.command {
            Commands::GenerateBindingTable { num_ipv4s, shift, .. } => {
                assert_eq!(num_ipv4s, 10);
                assert_eq!(shift, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(Cli::try_parse_from(["swconf", "generate-binding-table", "not-an-ip", "1", "::1", "::2", "0"]).is_err());
    }

    #[test]
    fn global_flags_accepted_after_subcommand() {
        let cli = parse(&["query", "--run-dir", "/tmp/sw", "--log-level", "debug", "lwaftr", "ipv4"]);
        assert_eq!(cli.run_dir, Some(PathBuf::from("/tmp/sw")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Commands::Query { target, filter, list_all } => {
                assert!(!list_all);
                assert_eq!(target.as_deref(), Some("lwaftr"));
                assert_eq!(filter.as_deref(), Some("ipv4"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
