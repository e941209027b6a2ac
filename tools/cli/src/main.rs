//! mirrorfs CLI - mount and inspect encrypted mirrors.
//!
//! The mirror is a plain directory tree whose regular files are encrypted
//! containers. `mount` exposes it as plaintext through FUSE; the other
//! commands go through the same mediation layer without mounting.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use mirrorfs_common::{VirtualPath, RESERVED_PREFIX};
use mirrorfs_mediator::{ContainerCodec, Dispatcher, KeyedCodec, MirrorConfig, StagingMode};

/// Bytes requested per read when streaming a file out.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Parser)]
#[command(name = "mirrorfs")]
#[command(about = "mirrorfs - Transparent encryption for a mirrored directory")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Read the passphrase from a file instead of prompting.
    #[arg(long, global = true)]
    passphrase_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Staging {
    Memory,
    Disk,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a mirror as a plaintext filesystem.
    Mount {
        /// Directory holding the encrypted containers.
        mirror: PathBuf,

        /// Where to mount the plaintext view.
        mountpoint: PathBuf,

        /// Where open files are staged.
        #[arg(long, value_enum, default_value = "memory")]
        staging: Staging,

        /// Parent directory for disk staging (default: system temp).
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        /// Allow other users to access the mount.
        #[arg(long)]
        allow_other: bool,

        /// Mount read-only.
        #[arg(long)]
        read_only: bool,
    },

    /// Print the plaintext of a file.
    Cat {
        /// Directory holding the encrypted containers.
        mirror: PathBuf,

        /// Path inside the mirror.
        path: String,
    },

    /// Encrypt a local file into the mirror.
    Import {
        /// Directory holding the encrypted containers.
        mirror: PathBuf,

        /// Local plaintext file.
        source: PathBuf,

        /// Destination path inside the mirror.
        dest: String,
    },

    /// Decrypt every container and report failures.
    Verify {
        /// Directory holding the encrypted containers.
        mirror: PathBuf,

        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let passphrase_file = cli.passphrase_file.as_deref();

    match cli.command {
        Commands::Mount {
            mirror,
            mountpoint,
            staging,
            staging_dir,
            allow_other,
            read_only,
        } => {
            let staging = match staging {
                Staging::Memory => StagingMode::Memory,
                Staging::Disk => StagingMode::Disk {
                    parent: staging_dir,
                },
            };
            cmd_mount(
                &mirror,
                &mountpoint,
                staging,
                allow_other,
                read_only,
                passphrase_file,
            )
            .await
        }

        Commands::Cat { mirror, path } => cmd_cat(&mirror, &path, passphrase_file),

        Commands::Import {
            mirror,
            source,
            dest,
        } => cmd_import(&mirror, &source, &dest, passphrase_file).await,

        Commands::Verify { mirror, json } => cmd_verify(&mirror, json, passphrase_file),
    }
}

/// Prompt for a passphrase securely.
fn prompt_passphrase(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let passphrase = rpassword::prompt_password(prompt).context("Failed to read passphrase")?;
    Ok(Zeroizing::new(passphrase.into_bytes()))
}

/// Read a passphrase file, dropping one trailing newline.
fn read_passphrase_file(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let mut data = Zeroizing::new(
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
    );
    if data.last() == Some(&b'\n') {
        data.pop();
        if data.last() == Some(&b'\r') {
            data.pop();
        }
    }
    if data.is_empty() {
        anyhow::bail!("Passphrase file {} is empty", path.display());
    }
    Ok(data)
}

/// Obtain the passphrase, asking twice when it will key a fresh mirror.
fn passphrase(file: Option<&Path>, confirm: bool) -> Result<Zeroizing<Vec<u8>>> {
    if let Some(path) = file {
        return read_passphrase_file(path);
    }

    let passphrase = prompt_passphrase("Enter passphrase: ")?;
    if passphrase.is_empty() {
        anyhow::bail!("Passphrase cannot be empty");
    }
    if confirm {
        let again = prompt_passphrase("Confirm passphrase: ")?;
        if *passphrase != *again {
            anyhow::bail!("Passphrases do not match");
        }
    }
    Ok(passphrase)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(entries.next().is_none())
}

fn open_dispatcher(mirror: &Path, staging: StagingMode, passphrase: &[u8]) -> Result<Dispatcher> {
    let config = MirrorConfig::new(mirror, passphrase).with_staging(staging);
    Dispatcher::new(config).context("Failed to open mirror")
}

/// Refuse to run a mount as root.
fn refuse_root() -> Result<()> {
    let (uid, euid) = unsafe { (libc::getuid(), libc::geteuid()) };
    if uid == 0 || euid == 0 {
        anyhow::bail!("Refusing to mount as root");
    }
    Ok(())
}

/// Mount a mirror until Ctrl-C.
async fn cmd_mount(
    mirror: &Path,
    mountpoint: &Path,
    staging: StagingMode,
    allow_other: bool,
    read_only: bool,
    passphrase_file: Option<&Path>,
) -> Result<()> {
    refuse_root()?;

    if !mirrorfs_fuse::is_fuse_available() {
        anyhow::bail!("{}", mirrorfs_fuse::fuse_info());
    }

    let fresh = is_empty_dir(mirror)?;
    let passphrase = passphrase(passphrase_file, fresh)?;
    let dispatcher = Arc::new(open_dispatcher(mirror, staging, &passphrase)?);

    let options = mirrorfs_fuse::MountOptions {
        allow_other,
        read_only,
        ..Default::default()
    };
    let handle = mirrorfs_fuse::mount(dispatcher.clone(), mountpoint, options)
        .context("Failed to mount mirror")?;

    println!("Mirror mounted!");
    println!("  Mirror: {}", dispatcher.mirror_root().display());
    println!("  Mount point: {}", handle.mount_point().display());
    println!("\nPress Ctrl-C to unmount.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;

    handle.unmount();
    if dispatcher.open_handles() > 0 {
        warn!("{} files were still open at unmount", dispatcher.open_handles());
    }
    println!("Unmounted.");

    Ok(())
}

/// Stream a file's plaintext to stdout.
fn cmd_cat(mirror: &Path, path: &str, passphrase_file: Option<&Path>) -> Result<()> {
    let passphrase = passphrase(passphrase_file, false)?;
    let dispatcher = open_dispatcher(mirror, StagingMode::Memory, &passphrase)?;

    let handle = dispatcher
        .mediate_open(path)
        .with_context(|| format!("Failed to open {}", path))?;

    let mut stdout = std::io::stdout().lock();
    let mut offset: i64 = 0;
    let streamed = loop {
        let chunk = match dispatcher.mediate_read(handle, offset, READ_CHUNK) {
            Ok(chunk) => chunk,
            Err(e) => break Err(anyhow::Error::new(e)),
        };
        if chunk.is_empty() {
            break Ok(());
        }
        if let Err(e) = stdout.write_all(&chunk) {
            break Err(e.into());
        }
        offset += chunk.len() as i64;
    };

    dispatcher
        .mediate_release(handle)
        .context("Failed to close file")?;
    streamed?;
    stdout.flush()?;

    Ok(())
}

/// Encrypt a local file into the mirror.
async fn cmd_import(
    mirror: &Path,
    source: &Path,
    dest: &str,
    passphrase_file: Option<&Path>,
) -> Result<()> {
    info!("Importing {} as {}", source.display(), dest);

    let content = Zeroizing::new(
        tokio::fs::read(source)
            .await
            .context("Failed to read source file")?,
    );

    let fresh = is_empty_dir(mirror)?;
    let passphrase = passphrase(passphrase_file, fresh)?;
    let dispatcher = open_dispatcher(mirror, StagingMode::Memory, &passphrase)?;

    let dest_path = VirtualPath::parse(dest).context("Invalid destination path")?;
    if let Some(parent) = dest_path.parent() {
        let backing = dispatcher.resolve(&parent.to_string_path())?;
        fs::create_dir_all(&backing)
            .with_context(|| format!("Failed to create {}", parent))?;
    }

    let handle = dispatcher
        .mediate_create(dest, 0o600)
        .context("Failed to create destination")?;
    let written = dispatcher.mediate_write(handle, 0, &content);
    let released = dispatcher.mediate_release(handle);
    written.context("Failed to write destination")?;
    released.context("Failed to encrypt destination")?;

    println!("File imported: {} ({} bytes)", dest, content.len());

    Ok(())
}

/// One container that failed to decode.
#[derive(Debug, Serialize)]
struct VerifyFailure {
    path: String,
    error: String,
}

/// Outcome of decoding every container in a mirror.
#[derive(Debug, Default, Serialize)]
struct VerifyReport {
    checked: usize,
    failures: Vec<VerifyFailure>,
    /// Leftover replace files from an interrupted write.
    stale_temp_files: Vec<String>,
    skipped: Vec<String>,
}

impl VerifyReport {
    fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Decode every regular file under `dir` with `codec`.
fn verify_tree(
    root: &Path,
    dir: &Path,
    codec: &dyn ContainerCodec,
    report: &mut VerifyReport,
) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = format!(
            "/{}",
            path.strip_prefix(root).unwrap_or(&path).display()
        );
        let file_type = entry.file_type()?;

        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(RESERVED_PREFIX)
        {
            report.stale_temp_files.push(relative);
        } else if file_type.is_dir() {
            verify_tree(root, &path, codec, report)?;
        } else if file_type.is_file() {
            report.checked += 1;
            let result = fs::read(&path)
                .map_err(mirrorfs_common::Error::from)
                .and_then(|container| codec.decode(&container).map(|_| ()));
            if let Err(e) = result {
                report.failures.push(VerifyFailure {
                    path: relative,
                    error: e.to_string(),
                });
            }
        } else {
            report.skipped.push(relative);
        }
    }
    Ok(())
}

/// Decrypt every container and report failures.
fn cmd_verify(mirror: &Path, json: bool, passphrase_file: Option<&Path>) -> Result<()> {
    let passphrase = passphrase(passphrase_file, false)?;
    let config = MirrorConfig::new(mirror, passphrase.as_slice());
    let root = config.validate().context("Invalid mirror")?;
    let codec = KeyedCodec::from_passphrase(config.passphrase.as_bytes(), &config.kdf_params)
        .context("Failed to derive key")?;

    let mut report = VerifyReport::default();
    verify_tree(&root, &root, &codec, &mut report)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Checked {} files", report.checked);
        for failure in &report.failures {
            println!("  [FAIL] {}: {}", failure.path, failure.error);
        }
        for stale in &report.stale_temp_files {
            println!("  [STALE] {}", stale);
        }
        for skipped in &report.skipped {
            println!("  [SKIP] {}", skipped);
        }
    }

    if !report.is_clean() {
        anyhow::bail!("{} of {} files failed to decrypt", report.failures.len(), report.checked);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirrorfs_crypto::KdfParams;
    use tempfile::TempDir;

    fn codec(passphrase: &[u8]) -> KeyedCodec {
        KeyedCodec::from_passphrase(passphrase, &KdfParams::insecure_fast()).unwrap()
    }

    #[test]
    fn test_passphrase_file_strips_newline() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("pass");
        fs::write(&file, b"hunter2\r\n").unwrap();

        assert_eq!(read_passphrase_file(&file).unwrap().as_slice(), b"hunter2");
    }

    #[test]
    fn test_empty_passphrase_file_rejected() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("pass");
        fs::write(&file, b"\n").unwrap();

        assert!(read_passphrase_file(&file).is_err());
    }

    #[test]
    fn test_verify_reports_failures() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let good = codec(b"pw");
        fs::create_dir(root.join("docs")).unwrap();
        fs::write(root.join("docs/a"), good.encode(b"alpha").unwrap()).unwrap();
        fs::write(root.join("b"), codec(b"other").encode(b"beta").unwrap()).unwrap();
        fs::write(root.join(".mirrorfs-123.tmp"), b"partial").unwrap();
        fs::write(root.join("empty"), b"").unwrap();

        let mut report = VerifyReport::default();
        verify_tree(root, root, &good, &mut report).unwrap();

        assert_eq!(report.checked, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, "/b");
        assert_eq!(report.stale_temp_files, vec!["/.mirrorfs-123.tmp".to_string()]);
        assert!(!report.is_clean());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["checked"], 3);
    }
}
