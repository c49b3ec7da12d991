use std::{
    fs,
    io::Write,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use model_market::{
    config::{Config, Overrides},
    host::{Call, Receipt},
    ledger::format_amount,
    rpc::{self, RpcClient, ServerLimits},
    store::{StateLock, StateStore},
    telemetry, Address, Amount, Error, Host, Model, ModelId, SignedTransaction, Transaction,
};

//==================== CLI ====================//

#[derive(Parser, Debug)]
#[command(name = "market", version)]
#[command(about = "Marketplace ledger for digital goods: list, buy, settle")]
struct Cli {
    /// JSON config file; every field is optional
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Local chain state file
    #[arg(long, global = true, env = "MARKET_STATE")]
    state: Option<PathBuf>,

    /// Talk to a running `market serve` instead of the local state file
    #[arg(long, global = true, env = "MARKET_RPC")]
    rpc: Option<String>,

    /// Fee burned from the sender of every committed transaction
    #[arg(long, global = true, env = "MARKET_TX_FEE")]
    tx_fee: Option<Amount>,

    /// Log filter, e.g. `debug` or `model_market=trace`
    #[arg(long, global = true, env = "MARKET_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct KeyArg {
    /// 32-byte ed25519 secret key, 64 hex chars
    #[arg(long, env = "MARKET_SK_HEX", hide_env_values = true)]
    sk_hex: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a keypair into <out-dir>/sk.hex, pk.hex, address
    Keygen {
        #[arg(long)]
        out_dir: PathBuf,
    },
    /// Print the address controlled by a secret key
    Address {
        #[command(flatten)]
        key: KeyArg,
    },
    /// Credit an account from the faucet (local state only)
    Fund { address: Address, amount: Amount },
    /// Freeze an account so it can neither pay nor be paid (local state only)
    Freeze {
        address: Address,
        #[arg(long)]
        unfreeze: bool,
    },
    /// List a model for sale
    List {
        #[arg(long)]
        name: String,
        #[arg(long)]
        price: Amount,
        /// Stored verbatim, never inspected
        #[arg(long)]
        url: String,
        #[command(flatten)]
        key: KeyArg,
    },
    /// Buy a model; the payment defaults to the listed price
    Buy {
        id: ModelId,
        #[arg(long)]
        value: Option<Amount>,
        #[command(flatten)]
        key: KeyArg,
    },
    /// Number of models ever listed
    Count,
    /// Show one model
    Show { id: ModelId },
    /// Show every model
    Models,
    /// Balance of an account
    Balance { address: Address },
    /// Chain height, state root and catalog size
    Status,
    /// Serve the JSON line RPC on the local state file
    Serve {
        #[arg(long)]
        listen: Option<String>,
    },
}

//==================== backend ====================//

enum Backend {
    /// Holds the state lock until the command finishes.
    Local {
        store: StateStore,
        host: Host,
        _lock: StateLock,
    },
    Remote(RpcClient),
}

impl Backend {
    fn open(config: &Config) -> Result<Self, Error> {
        if let Some(addr) = &config.rpc {
            let timeout = Duration::from_millis(config.rpc_timeout_ms);
            return Ok(Backend::Remote(RpcClient::new(addr.clone(), timeout)));
        }
        let store = StateStore::open(&config.state_path);
        let lock = store.lock()?;
        let host = Host::with_state(config.host_config(), store.load()?);
        Ok(Backend::Local {
            store,
            host,
            _lock: lock,
        })
    }

    fn local(&mut self) -> Result<(&StateStore, &mut Host), Error> {
        match self {
            Backend::Local { store, host, .. } => Ok((store, host)),
            Backend::Remote(_) => Err(Error::Input(
                "this command works on the local state file only; drop --rpc".into(),
            )),
        }
    }

    fn model_count(&self) -> Result<u64, Error> {
        match self {
            Backend::Local { host, .. } => Ok(host.model_count()),
            Backend::Remote(client) => Ok(client.model_count()?),
        }
    }

    fn get_model(&self, id: ModelId) -> Result<Option<Model>, Error> {
        match self {
            Backend::Local { host, .. } => Ok(host.get_model(id).cloned()),
            Backend::Remote(client) => Ok(client.get_model(id)?),
        }
    }

    fn list_models(&self) -> Result<Vec<Model>, Error> {
        match self {
            Backend::Local { host, .. } => Ok(host.models().cloned().collect()),
            Backend::Remote(client) => Ok(client.list_models()?),
        }
    }

    fn balance_of(&self, address: Address) -> Result<Amount, Error> {
        match self {
            Backend::Local { host, .. } => Ok(host.balance_of(&address)),
            Backend::Remote(client) => Ok(client.balance_of(address)?),
        }
    }

    fn nonce_of(&self, address: Address) -> Result<u64, Error> {
        match self {
            Backend::Local { host, .. } => Ok(host.nonce_of(&address)),
            Backend::Remote(client) => Ok(client.nonce_of(address)?),
        }
    }

    fn send(&mut self, signed: SignedTransaction) -> Result<Receipt, Error> {
        match self {
            Backend::Local { store, host, .. } => {
                let receipt = host.execute(&signed)?;
                store.save(host.state())?;
                Ok(receipt)
            }
            Backend::Remote(client) => Ok(client.send_transaction(signed)?),
        }
    }

    /// Fills in the sender nonce, signs and submits.
    fn submit(&mut self, key: &SigningKey, value: Amount, call: Call) -> Result<Receipt, Error> {
        let from = Address::from_verifying_key(&key.verifying_key());
        let tx = Transaction {
            from,
            nonce: self.nonce_of(from)?,
            value,
            call,
        };
        self.send(tx.sign(key))
    }
}

//==================== helpers ====================//

fn parse_sk_hex(sk_hex: &str) -> Result<SigningKey, Error> {
    let bytes = hex::decode(sk_hex.trim())
        .map_err(|err| Error::Input(format!("invalid sk-hex: {err}")))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::Input("sk-hex must be 32 bytes (64 hex chars)".into()))?;
    Ok(SigningKey::from_bytes(&arr))
}

fn write_all(p: &Path, bytes: &[u8]) -> Result<(), Error> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = fs::File::create(p)?;
    f.write_all(bytes)?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| Error::Input(format!("cannot render output: {err}")))?;
    println!("{text}");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config, Error> {
    let config = Config::load(cli.config.as_deref())?;
    Ok(config.apply(Overrides {
        state_path: cli.state.clone(),
        listen: None,
        rpc: cli.rpc.clone(),
        tx_fee: cli.tx_fee,
        log: cli.log.clone(),
    }))
}

//==================== commands ====================//

fn keygen_cmd(out_dir: &Path) -> Result<(), Error> {
    let mut sk_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut sk_bytes);
    let sk = SigningKey::from_bytes(&sk_bytes);
    let pk = sk.verifying_key();
    let address = Address::from_verifying_key(&pk);

    write_all(&out_dir.join("sk.hex"), hex::encode(sk_bytes).as_bytes())?;
    write_all(&out_dir.join("pk.hex"), hex::encode(pk.as_bytes()).as_bytes())?;
    write_all(&out_dir.join("address"), address.to_string().as_bytes())?;
    print_json(&json!({ "address": address, "out_dir": out_dir }))
}

fn serve_cmd(config: &Config, listen: Option<String>) -> Result<(), Error> {
    let store = StateStore::open(&config.state_path);
    let _lock = store.lock()?;
    let host = Host::with_state(config.host_config(), store.load()?);
    let listen = listen.unwrap_or_else(|| config.listen.clone());
    info!(
        %listen,
        state = %store.path().display(),
        height = host.height(),
        models = host.model_count(),
        tx_fee = host.config().tx_fee,
        "starting market rpc"
    );
    let listener = TcpListener::bind(&listen)?;
    rpc::serve(
        listener,
        Arc::new(Mutex::new(host)),
        Some(store),
        ServerLimits::default(),
    )?;
    Ok(())
}

fn run(command: Command, config: &Config) -> Result<(), Error> {
    match command {
        Command::Keygen { out_dir } => keygen_cmd(&out_dir),
        Command::Address { key } => {
            let sk = parse_sk_hex(&key.sk_hex)?;
            print_json(&json!({ "address": Address::from_verifying_key(&sk.verifying_key()) }))
        }
        Command::Serve { listen } => serve_cmd(config, listen),
        command => {
            let mut backend = Backend::open(config)?;
            run_with_backend(command, &mut backend)
        }
    }
}

fn run_with_backend(command: Command, backend: &mut Backend) -> Result<(), Error> {
    match command {
        Command::Fund { address, amount } => {
            let (store, host) = backend.local()?;
            host.fund(&address, amount)?;
            store.save(host.state())?;
            print_json(&json!({
                "address": address,
                "balance": host.balance_of(&address),
            }))
        }
        Command::Freeze { address, unfreeze } => {
            let (store, host) = backend.local()?;
            host.set_frozen(&address, !unfreeze);
            store.save(host.state())?;
            print_json(&json!({ "address": address, "frozen": !unfreeze }))
        }
        Command::List {
            name,
            price,
            url,
            key,
        } => {
            let sk = parse_sk_hex(&key.sk_hex)?;
            let receipt = backend.submit(
                &sk,
                0,
                Call::ListModel {
                    name,
                    price,
                    encrypted_download_url: url,
                },
            )?;
            print_json(&receipt)
        }
        Command::Buy { id, value, key } => {
            let sk = parse_sk_hex(&key.sk_hex)?;
            let value = match value {
                Some(v) => v,
                None => backend
                    .get_model(id)?
                    .map(|m| m.price)
                    .ok_or(model_market::MarketError::ModelNotFound(id))?,
            };
            let receipt = backend.submit(&sk, value, Call::BuyModel { id })?;
            print_json(&receipt)
        }
        Command::Count => print_json(&json!({ "modelCount": backend.model_count()? })),
        Command::Show { id } => match backend.get_model(id)? {
            Some(model) => print_json(&model),
            None => Err(model_market::MarketError::ModelNotFound(id).into()),
        },
        Command::Models => print_json(&backend.list_models()?),
        Command::Balance { address } => {
            let balance = backend.balance_of(address)?;
            print_json(&json!({
                "address": address,
                "balance": balance,
                "coins": format_amount(balance),
            }))
        }
        Command::Status => match backend {
            Backend::Local { store, host, .. } => print_json(&json!({
                "state": store.path(),
                "height": host.height(),
                "modelCount": host.model_count(),
                "stateRoot": host.state_root(),
                "receipts": host.receipts().len(),
                "txFee": host.config().tx_fee,
            })),
            Backend::Remote(client) => print_json(&client.health()?),
        },
        Command::Keygen { .. } | Command::Address { .. } | Command::Serve { .. } => Err(
            Error::Input("command does not take a backend".into()),
        ),
    }
}

//==================== main ====================//

fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    telemetry::init(&config.log);

    if let Err(err) = run(cli.command, &config) {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}
