use std::io::{self, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sortedkv::config::{init_config, Configuration, CONFIG, DEFAULT_CONFIG_FILE};
use sortedkv::index;
use sortedkv::sorted::{self, foreach_in_range, new_key_value, KeyValue, KvConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect and maintain a sorted key-value index", long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = DEFAULT_CONFIG_FILE.to_string())]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the value stored under KEY.
    Get { key: String },
    /// Store VALUE under KEY.
    Set { key: String, value: String },
    /// Remove KEY.
    Delete { key: String },
    /// Print every row in [start, end) as key<TAB>value.
    Dump {
        #[arg(long, default_value = "")]
        start: String,
        #[arg(long, default_value = "")]
        end: String,
    },
    /// Delete every row.
    Wipe,
    /// Create SQL tables if needed and stamp the index schema version.
    Init,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Prepares the storage named by the config before it is opened.
fn init_storage(conf: &Configuration, kv_cfg: &KvConfig) -> Result<()> {
    if conf.index_type() == Some("sqlite") {
        let mut cfg = kv_cfg.clone();
        let file = cfg.required_string("file");
        sorted::sqlite::init_db(file)?;
    }
    // postgres and mysql create their tables when opened
    Ok(())
}

fn run(command: Command, conf: &Configuration) -> Result<()> {
    let kv_cfg = conf.index_config()?;
    if let Command::Init = command {
        init_storage(conf, &kv_cfg)?;
    }

    let kv = new_key_value(kv_cfg)?;
    let res = run_on(kv.as_ref(), command);
    let close_res = kv.close();
    res?;
    close_res
}

fn run_on(kv: &dyn KeyValue, command: Command) -> Result<()> {
    match command {
        Command::Get { key } => {
            let value = kv.get(&key)?;
            println!("{value}");
        }
        Command::Set { key, value } => kv.set(&key, &value)?,
        Command::Delete { key } => kv.delete(&key)?,
        Command::Dump { start, end } => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let mut n = 0;
            foreach_in_range(kv, &start, &end, |k, v| {
                n += 1;
                writeln!(out, "{k}\t{v}")?;
                Ok(())
            })?;
            info!("dumped {n} rows");
        }
        Command::Wipe => {
            kv.wipe()?;
            info!("wiped index");
        }
        Command::Init => {
            index::init_schema_version(kv)?;
            info!("index initialized at schema version {}", index::REQUIRED_SCHEMA_VERSION);
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // log_level from the config wins over RUST_LOG, so peek at it first
    let log_level = Configuration::parse_config_file(&args.config)
        .ok()
        .and_then(|c| c.log_level);
    init_tracing(log_level.as_deref());

    init_config(&args.config)
        .inspect_err(|e| error!("failed to initialize configuration, err: {e}"))?;

    let conf = CONFIG.read().clone();
    run(args.command, &conf).inspect_err(|e| error!("kvtool failed, err: {e}"))?;
    Ok(())
}
