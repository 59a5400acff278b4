use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

use tpm_appsk::{
    config::{self, Config},
    context, export,
    keys::{self, ArtifactPaths, EnsureOptions, Evicted},
    sign::{self, KeySource},
    transport, ContextBlob, PersistentHandle, Session, Tpm, TpmError,
};

#[cfg(feature = "tpm")]
type Device = tpm_appsk::TssTpm;
#[cfg(not(feature = "tpm"))]
type Device = tpm_appsk::SoftTpm;

#[derive(Parser, Debug)]
#[command(name = "tpm-appsk")]
#[command(about = "TPM application signing key provisioning and signing", version)]
struct Cli {
    /// TCTI string such as `device:/dev/tpmrm0`. Skips transport discovery.
    #[arg(long, global = true, env = "TCTI")]
    tcti: Option<String>,

    /// Persistent slot of the application key.
    #[arg(long, global = true, env = "APP_HANDLE", value_parser = config::parse_slot)]
    app_handle: Option<PersistentHandle>,

    /// Persistent slot of the attestation key used by `provision --certify`.
    #[arg(long, global = true, env = "AK_HANDLE", value_parser = config::parse_slot)]
    ak_handle: Option<PersistentHandle>,

    /// Raise log verbosity. Overridden by RUST_LOG.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the application key, or reuse the one already persisted
    Provision {
        /// Evict and replace an existing key
        #[arg(long)]
        force: bool,

        /// Certify a newly created key with the attestation key
        #[arg(long)]
        certify: bool,

        /// Directory for every artifact
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Where to write the context blob
        ctx_path: Option<PathBuf>,

        /// Where to write the PEM public key
        pubkey_path: Option<PathBuf>,
    },

    /// Sign a message file with a persistent slot or a context blob
    Sign {
        /// `0x` prefixed slot, or a context file
        key: String,
        message: PathBuf,
        signature_out: PathBuf,
        info_out: PathBuf,
    },

    /// Remove the key persisted at a slot
    Evict {
        /// Slot in hex, with or without `0x`
        slot: String,
    },

    /// Load a context blob, read its public area, and flush it again
    VerifyContext { context: PathBuf },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(feature = "tpm")]
fn open_session(config: &Config) -> Result<Session<Device>, TpmError> {
    let descriptor = transport::discover(config)?;
    println!("[INFO] Using TCTI: {descriptor}");
    Session::open(descriptor)
}

#[cfg(not(feature = "tpm"))]
fn open_session(config: &Config) -> Result<Session<Device>, TpmError> {
    let descriptor = transport::discover(config)?;
    error!(%descriptor, "device support not compiled in, rebuild with the tpm feature");
    Err(TpmError::FeatureNotEnabled)
}

fn provision<T: Tpm>(
    tpm: &mut T,
    config: &Config,
    force: bool,
    certify: bool,
    paths: &ArtifactPaths,
) -> anyhow::Result<()> {
    let options = EnsureOptions {
        force,
        certify_with: certify.then_some(config.ak_handle),
    };

    let provisioned = keys::ensure_with(tpm, config.app_handle, &options)
        .with_context(|| format!("Unable to provision AppSK at {}", config.app_handle))?;

    if provisioned.created {
        println!(
            "[SUCCESS] AppSK created and persisted at {}",
            provisioned.slot
        );
    } else {
        println!(
            "[INFO] Found existing AppSK at {}, reusing",
            provisioned.slot
        );
    }

    if certify && provisioned.created && provisioned.certification.is_none() {
        eprintln!(
            "[WARN] No certification produced with attestation key {}",
            config.ak_handle
        );
    }
    if provisioned.context.is_none() {
        eprintln!("[WARN] Context blob unavailable, sign with the persistent slot instead");
    }

    provisioned
        .write_artifacts(paths)
        .context("Unable to write provisioning artifacts")?;

    let fingerprint = export::fingerprint(&provisioned.public)?;
    println!(
        "[INFO] Public key fingerprint (sha256): {}",
        crypto_glue::hex::encode(fingerprint)
    );
    for path in [&paths.context, &paths.public_pem].into_iter().flatten() {
        if path.exists() {
            println!("[SUCCESS] Wrote {}", path.display());
        }
    }

    Ok(())
}

fn sign_message<T: Tpm>(
    tpm: &mut T,
    source: &KeySource,
    message: &Path,
    signature_out: &Path,
    info_out: &Path,
) -> anyhow::Result<()> {
    let data =
        fs::read(message).with_context(|| format!("Unable to read {}", message.display()))?;

    let artifact = sign::sign(tpm, source, &data).context("Signing failed")?;
    if artifact.fallback_used() {
        eprintln!("[WARN] Direct sign rejected, signed with a device digest and ticket");
    }

    artifact
        .write_to(signature_out, info_out)
        .context("Unable to write signature")?;

    println!(
        "[INFO] Scheme: {} / {}",
        artifact.scheme().name(),
        artifact.hash_alg().name()
    );
    println!(
        "[SUCCESS] Signature ({} bytes) written to {}",
        artifact.signature().len(),
        signature_out.display()
    );
    Ok(())
}

fn evict<T: Tpm>(tpm: &mut T, slot: PersistentHandle) -> anyhow::Result<()> {
    match keys::evict(tpm, slot).with_context(|| format!("Unable to evict {slot}"))? {
        Evicted::Removed => println!("[SUCCESS] Evicted {slot}"),
        Evicted::NotFound => println!("[INFO] Nothing persisted at {slot}"),
    }
    Ok(())
}

fn verify_context<T: Tpm>(tpm: &mut T, blob: &ContextBlob) -> anyhow::Result<()> {
    let public = context::verify(tpm, blob).context("Context blob did not load")?;
    let pem = export::public_key_pem(&public)?;
    println!("[SUCCESS] Context loads on this device");
    print!("{pem}");
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env().context("Invalid configuration")?;
    if let Some(tcti) = cli.tcti {
        config.tcti = Some(tcti);
    }
    if let Some(app_handle) = cli.app_handle {
        config.app_handle = app_handle;
    }
    if let Some(ak_handle) = cli.ak_handle {
        config.ak_handle = ak_handle;
    }
    debug!(?config);

    // Parse everything that can fail before a device session is opened.
    enum Action {
        Provision {
            force: bool,
            certify: bool,
            paths: ArtifactPaths,
        },
        Sign {
            source: KeySource,
            message: PathBuf,
            signature_out: PathBuf,
            info_out: PathBuf,
        },
        Evict(PersistentHandle),
        VerifyContext(ContextBlob),
    }

    let action = match cli.command {
        Commands::Provision {
            force,
            certify,
            out_dir,
            ctx_path,
            pubkey_path,
        } => {
            let mut paths = ArtifactPaths::in_dir(out_dir.as_deref().unwrap_or(Path::new(".")));
            if ctx_path.is_some() {
                paths.context = ctx_path;
            }
            if pubkey_path.is_some() {
                paths.public_pem = pubkey_path;
            }
            if !certify {
                paths.attest = None;
                paths.attest_signature = None;
            }
            Action::Provision {
                force,
                certify,
                paths,
            }
        }
        Commands::Sign {
            key,
            message,
            signature_out,
            info_out,
        } => Action::Sign {
            source: KeySource::parse(&key).with_context(|| format!("Invalid key {key}"))?,
            message,
            signature_out,
            info_out,
        },
        Commands::Evict { slot } => Action::Evict(
            PersistentHandle::parse_hex(&slot).with_context(|| format!("Invalid slot {slot}"))?,
        ),
        Commands::VerifyContext { context } => Action::VerifyContext(
            ContextBlob::read_from(&context)
                .with_context(|| format!("Unable to read {}", context.display()))?,
        ),
    };

    let mut session = open_session(&config).context("No TPM available")?;

    let res = match &action {
        Action::Provision {
            force,
            certify,
            paths,
        } => provision(&mut session, &config, *force, *certify, paths),
        Action::Sign {
            source,
            message,
            signature_out,
            info_out,
        } => sign_message(&mut session, source, message, signature_out, info_out),
        Action::Evict(slot) => evict(&mut session, *slot),
        Action::VerifyContext(blob) => verify_context(&mut session, blob),
    };

    session.close();
    res
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "command failed");
            eprintln!("[ERROR] {err:#}");
            ExitCode::FAILURE
        }
    }
}
