#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use structopt::StructOpt;

use atlas_relayer::blockstore::FileBlockStore;
use atlas_relayer::context::RelayerContext;
use atlas_relayer::service::Core;
use atlas_relayer::{config, keystore};

/// The Atlas Relayer command-line tool
///
/// Start the relayer from a config file:
///
///     $ atlas-relayer -vvv -c <CONFIG_FILE_PATH>
#[derive(StructOpt)]
#[structopt(name = "Atlas Relayer")]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    verbose: i32,
    /// File that contains the configuration.
    #[structopt(
        short = "c",
        long = "config",
        value_name = "PATH",
        parse(from_os_str)
    )]
    config: Option<PathBuf>,
    /// Overrides the blockstore directory from the config file.
    #[structopt(long, value_name = "PATH", parse(from_os_str))]
    blockstore: Option<PathBuf>,
    /// Resets every chain's cursor to its configured start block.
    #[structopt(long)]
    fresh_start: bool,
    /// Jumps every chain's cursor to its current tip.
    #[structopt(long)]
    latest: bool,
    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(StructOpt)]
enum Command {
    /// Manage the relayer keystore.
    Accounts(AccountsCommand),
}

#[derive(StructOpt)]
enum AccountsCommand {
    /// Generate a new key into the keystore directory.
    Generate {
        /// Directory to write the keystore file into.
        #[structopt(long, value_name = "PATH", parse(from_os_str))]
        keystore: PathBuf,
        /// Password the new keystore file is encrypted with.
        #[structopt(long)]
        password: String,
    },
    /// Import a raw hex private key into the keystore directory.
    Import {
        /// Directory to write the keystore file into.
        #[structopt(long, value_name = "PATH", parse(from_os_str))]
        keystore: PathBuf,
        /// The private key, 0x-prefixed hex.
        #[structopt(long = "private-key")]
        private_key: String,
        /// Password the keystore file is encrypted with.
        #[structopt(long)]
        password: String,
    },
    /// List the keystore files.
    List {
        /// Directory to list.
        #[structopt(long, value_name = "PATH", parse(from_os_str))]
        keystore: PathBuf,
    },
}

#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose)?;
    match args.command {
        Some(Command::Accounts(cmd)) => handle_accounts(cmd),
        None => start_relay(args).await,
    }
}

fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing::Level;
    let log_level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let directive = format!("atlas_relayer={}", log_level)
        .parse()
        .expect("valid log level");
    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(directive);
    tracing_subscriber::fmt()
        .with_target(true)
        .with_max_level(log_level)
        .with_env_filter(env_filter)
        .init();
    Ok(())
}

fn handle_accounts(command: AccountsCommand) -> anyhow::Result<()> {
    match command {
        AccountsCommand::Generate { keystore, password } => {
            let (address, file) = keystore::generate(&keystore, &password)?;
            println!("{address:?} {file}");
        }
        AccountsCommand::Import {
            keystore,
            private_key,
            password,
        } => {
            let (address, file) =
                keystore::import(&keystore, &private_key, &password)?;
            println!("{address:?} {file}");
        }
        AccountsCommand::List { keystore } => {
            for name in keystore::list(&keystore)? {
                println!("{name}");
            }
        }
    }
    Ok(())
}

async fn start_relay(args: Opts) -> anyhow::Result<()> {
    tracing::info!("Starting Atlas Relayer...");
    let config_path = args
        .config
        .context("no config file given, use -c <CONFIG_FILE_PATH>")?;
    let mut config = config::load(&config_path)
        .context("failed to load the config file")?;
    if let Some(blockstore) = args.blockstore {
        config.blockstore_path = blockstore;
    }
    if args.fresh_start || args.latest {
        for chain in std::iter::once(&mut config.hub_chain)
            .chain(&mut config.chains)
        {
            chain.fresh_start |= args.fresh_start;
            chain.latest_only |= args.latest;
        }
    }
    let store = Arc::new(
        FileBlockStore::open(config.blockstore_path.clone())
            .context("failed to open the blockstore")?,
    );
    let ctx = RelayerContext::new(config)?;
    let core = Core::build(ctx, store)
        .context("failed to compose the configured chains")?;
    core.run().await?;
    Ok(())
}
