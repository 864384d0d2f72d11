use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use zeroize::Zeroizing;

use sigil_crypto::persistence::{has_valid_header, load_store_file, save_store_file};
use sigil_crypto::{
    parse_key_token, prekey, serialize_key_token, InMemoryDirectory, InMemoryKeyStore, KeyStore,
    SecureMessenger,
};
use sigil_protocol::{decode, encode, BackupEnvelope};

mod config;

use config::CliConfig;

type Messenger = SecureMessenger<InMemoryKeyStore, InMemoryDirectory>;

#[derive(Parser)]
#[command(name = "sigil", about = "Sigil end-to-end encryption key management")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Path to the encrypted key store, overrides config
    #[arg(long)]
    store: Option<PathBuf>,

    /// Password protecting the key store file
    #[arg(long, env = "SIGIL_STORE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new identity and key store
    Init {
        #[arg(long)]
        user: String,
        #[arg(long, default_value_t = 1)]
        device: u32,
    },
    /// Print the publishable pre-key bundle as JSON
    Bundle,
    /// Generate one-time pre-keys if below the low-water mark
    Replenish,
    /// Rotate the signed pre-key when due
    Rotate {
        /// Rotate even if the current key is still fresh
        #[arg(long)]
        force: bool,
    },
    /// Passphrase-protected backups
    #[command(subcommand)]
    Backup(BackupCommand),
    /// Attachment encryption
    #[command(subcommand)]
    Attach(AttachCommand),
    /// Print a random word passphrase
    Passphrase {
        #[arg(long)]
        words: Option<usize>,
    },
    /// Show safety numbers for every known device of a user
    SafetyNumber { user: String },
    /// Summarize the key store
    Info,
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Write an encrypted backup of the key store
    Create {
        #[arg(short, long)]
        output: PathBuf,
        /// Generated (and printed) when omitted
        #[arg(long, env = "SIGIL_BACKUP_PASSPHRASE", hide_env_values = true)]
        passphrase: Option<String>,
    },
    /// Replace the key store with the contents of a backup
    Restore {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long, env = "SIGIL_BACKUP_PASSPHRASE", hide_env_values = true)]
        passphrase: String,
    },
    /// Check a backup's structure and age without decrypting it
    Validate {
        #[arg(short, long)]
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum AttachCommand {
    /// Encrypt a file and print its key token
    Encrypt {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Decrypt a file with a key token
    Decrypt {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        key: String,
    },
}

/// Store file location plus the password that opens it.
struct Workspace {
    config: CliConfig,
    password: Option<Zeroizing<String>>,
}

impl Workspace {
    fn password(&self) -> Result<&str> {
        match &self.password {
            Some(password) => Ok(password.as_str()),
            None => bail!("store password required (--password or SIGIL_STORE_PASSWORD)"),
        }
    }

    fn messenger(&self, store: InMemoryKeyStore) -> Messenger {
        SecureMessenger::new(
            Arc::new(store),
            Arc::new(InMemoryDirectory::new()),
            self.config.crypto.clone(),
        )
    }

    /// A messenger over an empty store, without touching the store file.
    fn detached(&self) -> Messenger {
        self.messenger(InMemoryKeyStore::new())
    }

    fn open(&self) -> Result<Messenger> {
        let path = &self.config.store_path;
        let snapshot = load_store_file(path, self.password()?)
            .with_context(|| format!("failed to open key store: {}", path.display()))?;
        Ok(self.messenger(InMemoryKeyStore::from_snapshot(snapshot)))
    }

    async fn save(&self, messenger: &Messenger) -> Result<()> {
        let snapshot = messenger.store().snapshot().await?;
        save_store_file(
            &self.config.store_path,
            &snapshot,
            self.password()?,
            messenger.cipher(),
            self.config.store_kdf_iterations,
        )
        .with_context(|| format!("failed to write key store: {}", self.config.store_path.display()))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sigil=info,sigil_crypto=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        CliConfig::default()
    };
    if let Some(store) = args.store {
        config.store_path = store;
    }

    let workspace = Workspace {
        config,
        password: args.password.map(Zeroizing::new),
    };
    run(&workspace, args.command).await
}

async fn run(workspace: &Workspace, command: Command) -> Result<()> {
    match command {
        Command::Init { user, device } => {
            let path = &workspace.config.store_path;
            if path.exists() {
                bail!("key store already exists: {}", path.display());
            }
            let messenger = workspace.detached();
            messenger.provision(&user, device).await?;
            workspace.save(&messenger).await?;
            let identity = messenger.local_identity().await?;
            info!(
                user = %identity.user_id,
                device = identity.device_id,
                fingerprint = %identity.key_pair.public_key.fingerprint(),
                "identity created"
            );
            println!("{}", identity.key_pair.public_key.fingerprint());
        }
        Command::Bundle => {
            let messenger = workspace.open()?;
            let data = prekey::full_bundle_data(&**messenger.store()).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Replenish => {
            let messenger = workspace.open()?;
            let generated = messenger.replenish_prekeys().await?;
            if generated > 0 {
                workspace.save(&messenger).await?;
            }
            println!("{generated}");
        }
        Command::Rotate { force } => {
            let messenger = workspace.open()?;
            let rotated = messenger.rotate_signed_prekey(force).await?;
            if rotated {
                workspace.save(&messenger).await?;
            }
            println!("{}", if rotated { "rotated" } else { "current key still fresh" });
        }
        Command::Backup(command) => backup(workspace, command).await?,
        Command::Attach(command) => attach(workspace, command)?,
        Command::Passphrase { words } => {
            let count = words.unwrap_or(workspace.config.crypto.passphrase_word_count);
            println!("{}", sigil_crypto::passphrase::generate_secure_passphrase(count));
        }
        Command::SafetyNumber { user } => {
            let messenger = workspace.open()?;
            let numbers = messenger.generate_safety_number(&user).await?;
            if numbers.is_empty() {
                bail!("no known identity for {user}");
            }
            for number in numbers {
                let status = if number.verified { "verified" } else { "unverified" };
                println!("{} ({status})\n{number}\n", number.address);
            }
        }
        Command::Info => {
            let messenger = workspace.open()?;
            let identity = messenger.local_identity().await?;
            let snapshot = messenger.store().snapshot().await?;
            println!("address:          {}", identity.address());
            println!("registration id:  {}", identity.registration_id);
            println!("identity:         {}", identity.key_pair.public_key.fingerprint());
            println!("cipher:           {:?}", messenger.cipher().suite());
            println!("one-time prekeys: {}", snapshot.prekeys.len());
            println!("signed prekeys:   {}", snapshot.signed_prekeys.len());
            println!("sessions:         {}", snapshot.sessions.len());
            println!("sender keys:      {}", snapshot.sender_keys.len());
            println!("known identities: {}", snapshot.identities.len());
        }
    }
    Ok(())
}

async fn backup(workspace: &Workspace, command: BackupCommand) -> Result<()> {
    match command {
        BackupCommand::Create { output, passphrase } => {
            let messenger = workspace.open()?;
            let passphrase = match passphrase {
                Some(passphrase) => Zeroizing::new(passphrase),
                None => {
                    let generated = Zeroizing::new(messenger.generate_secure_passphrase());
                    println!("passphrase: {}", generated.as_str());
                    generated
                }
            };
            let envelope = messenger.create_backup(&passphrase).await?;
            write_atomic(&output, &encode(&envelope)?)?;
            info!(path = %output.display(), "backup written");
        }
        BackupCommand::Restore { input, passphrase } => {
            let passphrase = Zeroizing::new(passphrase);
            let envelope = read_backup(&input)?;
            let path = &workspace.config.store_path;
            // Existing stores must open with the given password before being replaced.
            if path.exists() {
                let data = fs::read(path)?;
                if has_valid_header(&data) {
                    workspace.open()?;
                }
            }
            let messenger = workspace.detached();
            messenger.validate_backup(&envelope)?;
            messenger.restore_backup(&envelope, &passphrase).await?;
            workspace.save(&messenger).await?;
            let identity = messenger.local_identity().await?;
            println!("restored {}", identity.address());
        }
        BackupCommand::Validate { input } => {
            let envelope = read_backup(&input)?;
            workspace.detached().validate_backup(&envelope)?;
            println!(
                "ok: {}.{} created {} ms since epoch",
                envelope.user_id, envelope.device_id, envelope.created_at
            );
        }
    }
    Ok(())
}

fn attach(workspace: &Workspace, command: AttachCommand) -> Result<()> {
    let messenger = workspace.detached();
    match command {
        AttachCommand::Encrypt { input, output } => {
            let mut reader = BufReader::new(
                File::open(&input).with_context(|| format!("failed to open {}", input.display()))?,
            );
            let mut writer = BufWriter::new(File::create(&output)?);
            let key_data = messenger.encrypt_file_stream(&mut reader, &mut writer)?;
            writer.flush()?;
            println!("{}", serialize_key_token(&key_data)?);
        }
        AttachCommand::Decrypt { input, output, key } => {
            let key_data = parse_key_token(&key)?;
            let mut reader = BufReader::new(
                File::open(&input).with_context(|| format!("failed to open {}", input.display()))?,
            );
            let tmp = output.with_extension("part");
            let mut writer = BufWriter::new(File::create(&tmp)?);
            let result = messenger
                .decrypt_file_stream(&key_data, &mut reader, &mut writer)
                .map_err(anyhow::Error::from)
                .and_then(|written| {
                    writer.flush()?;
                    Ok(written)
                });
            drop(writer);
            match result {
                Ok(written) => {
                    fs::rename(&tmp, &output)?;
                    info!(bytes = written, path = %output.display(), "attachment decrypted");
                }
                Err(e) => {
                    let _ = fs::remove_file(&tmp);
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn read_backup(path: &Path) -> Result<BackupEnvelope> {
    let data = fs::read(path).with_context(|| format!("failed to read backup: {}", path.display()))?;
    decode(&data).context("not a backup file")
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
