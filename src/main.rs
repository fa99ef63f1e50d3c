use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use idmd::config::{Config, HandlerKind};
use idmd::ldif::parse::{parse_ldif, write_ldif};
use idmd::server::Server;
use idmd::store::{DirStore, StoreOptions};

/// Configuration or bind failures at startup exit with this code.
const EXIT_CODE_STARTUP_ERROR: u8 = 64;

#[derive(Parser)]
#[command(name = "idmd", version, about = "Lightweight LDAP v3 identity management daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the LDAP service
    Serve(ServeArgs),

    /// Persistent database tooling
    #[command(subcommand)]
    Db(DbCommands),
}

#[derive(Args)]
struct ServeArgs {
    /// Log level (one of panic, fatal, error, warn, info or debug)
    #[arg(long, default_value = "info", env = "IDMD_LOG_LEVEL")]
    log_level: String,

    /// Name of the handler to use (ldif or boltdb)
    #[arg(long, default_value = "ldif")]
    ldap_handler: String,

    /// TCP listen address for LDAP requests
    #[arg(long, default_value = "127.0.0.1:10389", env = "IDMD_LDAP_LISTEN")]
    ldap_listen: String,

    /// TCP listen address for LDAPS requests
    #[arg(long, env = "IDMD_LDAPS_LISTEN")]
    ldaps_listen: Option<String>,

    /// Server certificate for LDAPS connections
    #[arg(long, env = "IDMD_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// Server certificate key for LDAPS connections
    #[arg(long, env = "IDMD_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// BaseDN for LDAP requests
    #[arg(long, default_value = "dc=lg,dc=local", env = "IDMD_LDAP_BASEDN")]
    ldap_base_dn: String,

    /// Allow anonymous LDAP bind for local LDAP clients
    #[arg(long)]
    ldap_allow_local_anonymous: bool,

    /// Path to an LDIF file or a folder containing .ldif files
    #[arg(long, env = "IDMD_LDIF_MAIN")]
    ldif_main: Option<PathBuf>,

    /// Path to an LDIF file with entries used only for bind
    #[arg(long, env = "IDMD_LDIF_CONFIG")]
    ldif_config: Option<PathBuf>,

    /// Database file for the boltdb handler
    #[arg(long, default_value = "idmbolt.db", env = "IDMD_BOLTDB_FILE")]
    boltdb_file: PathBuf,

    /// Default for the Company value used in LDIF templates
    #[arg(long, default_value = "Default")]
    ldif_template_default_company: String,

    /// Default for the MailDomain value used in LDIF templates
    #[arg(long, default_value = "lg.local")]
    ldif_template_default_mail_domain: String,

    /// Extra KEY=VALUE variables for LDIF templates
    #[arg(long = "ldif-template-var", value_parser = parse_key_value)]
    ldif_template_vars: Vec<(String, String)>,

    /// Enable metrics
    #[arg(long)]
    with_metrics: bool,

    /// TCP listen address for metrics
    #[arg(long, default_value = "127.0.0.1:6389")]
    metrics_listen: SocketAddr,

    /// Enable pprof
    #[arg(long)]
    with_pprof: bool,

    /// TCP listen address for pprof
    #[arg(long, default_value = "127.0.0.1:6060")]
    pprof_listen: SocketAddr,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Import an LDIF file into the database
    Load {
        #[arg(long, default_value = "idmbolt.db")]
        boltdb_file: PathBuf,
        #[arg(long)]
        ldap_base_dn: String,
        /// LDIF file to import
        ldif_file: PathBuf,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
    /// Export the database as LDIF on stdout
    Export {
        #[arg(long, default_value = "idmbolt.db")]
        boltdb_file: PathBuf,
        #[arg(long)]
        ldap_base_dn: String,
        #[arg(long, default_value = "info")]
        log_level: String,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    // panic and fatal collapse onto error.
    let level = match level {
        "panic" | "fatal" => "error",
        other => other,
    };
    let filter = EnvFilter::try_new(level)
        .map_err(|e| anyhow::anyhow!("invalid log level {level:?}: {e}"))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args),
        Commands::Db(command) => db(command),
    }
}

fn serve(args: ServeArgs) -> ExitCode {
    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("Error: {e}");
        return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
    }

    let handler = match args.ldap_handler.parse::<HandlerKind>() {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
        }
    };

    let config = Config {
        ldap_listen_addr: args.ldap_listen,
        ldaps_listen_addr: args.ldaps_listen,
        tls_cert_file: args.tls_cert_file,
        tls_key_file: args.tls_key_file,
        ldap_base_dn: args.ldap_base_dn,
        ldap_allow_local_anonymous_bind: args.ldap_allow_local_anonymous,
        ldap_handler: handler,
        ldif_main: args.ldif_main,
        ldif_config: args.ldif_config,
        boltdb_file: args.boltdb_file,
        ldif_default_company: args.ldif_template_default_company,
        ldif_default_mail_domain: args.ldif_template_default_mail_domain,
        ldif_template_extra_vars: args.ldif_template_vars.into_iter().collect::<HashMap<_, _>>(),
        metrics_listen_addr: args.with_metrics.then_some(args.metrics_listen),
    };

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
    }
    if args.with_pprof {
        warn!(listen_addr = %args.pprof_listen, "pprof endpoint is not available in this build");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
        }
    };

    // Handler construction loads LDIF / opens the database; failures here
    // are startup errors.
    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_CODE_STARTUP_ERROR);
        }
    };

    info!("serve start");
    match runtime.block_on(server.serve()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn db(command: DbCommands) -> ExitCode {
    let result = match command {
        DbCommands::Load {
            boltdb_file,
            ldap_base_dn,
            ldif_file,
            log_level,
        } => init_logging(&log_level).and_then(|()| load(&boltdb_file, &ldap_base_dn, &ldif_file)),
        DbCommands::Export {
            boltdb_file,
            ldap_base_dn,
            log_level,
        } => init_logging(&log_level).and_then(|()| export(&boltdb_file, &ldap_base_dn)),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load(boltdb_file: &PathBuf, base_dn: &str, ldif_file: &PathBuf) -> anyhow::Result<()> {
    let store = DirStore::open(base_dn, boltdb_file, StoreOptions::default())?;
    let text = std::fs::read_to_string(ldif_file)
        .map_err(|e| anyhow::anyhow!("error opening file {}: {e}", ldif_file.display()))?;
    let entries = parse_ldif(&text)?;
    for entry in &entries {
        debug!(dn = %entry.dn, "adding entry");
        store
            .entry_put(entry)
            .map_err(|e| anyhow::anyhow!("error adding entry {:?}: {e}", entry.dn))?;
    }
    info!(count = entries.len(), "import complete");
    Ok(())
}

fn export(boltdb_file: &PathBuf, base_dn: &str) -> anyhow::Result<()> {
    let store = DirStore::open(base_dn, boltdb_file, StoreOptions { read_only: true })?;
    let entries = store.all_entries()?;
    print!("{}", write_ldif(&entries));
    Ok(())
}
