use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use hmac::{Hmac, Mac};
use revision_kernel_core::{decode_snapshot, ItemId, Revision, RevisionId};
use revision_kernel_store_sqlite::{ExportManifest, RevisionStore, StoreOptions};
use serde_json::Value;
use sha2::Sha256;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_SIG_FILE: &str = "manifest.sig";
const SIGNATURE_ALGORITHM: &str = "hmac-sha256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Parser)]
#[command(name = "rvk")]
#[command(about = "Revision Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./revision_kernel.sqlite3")]
    db: PathBuf,

    /// Revision table name, for deployments with dedicated revision tables.
    #[arg(long, default_value = "revisions")]
    table: String,

    /// Ordering timestamp column name.
    #[arg(long, default_value = "recorded_at")]
    timestamp_column: String,

    /// Create deployments without the update-diff column.
    #[arg(long, default_value_t = false)]
    no_changes_column: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Trail {
        #[command(subcommand)]
        command: Box<TrailCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
    #[arg(long)]
    verify_key_file: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    allow_unsigned: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TrailCommand {
    List(TrailListArgs),
    Show(TrailShowArgs),
    Changeset(TrailShowArgs),
    StateAt(TrailStateAtArgs),
}

#[derive(Debug, Args)]
struct TrailListArgs {
    #[arg(long)]
    item_type: String,
    #[arg(long)]
    item_id: String,
    /// Restrict to one event kind: create, update, or destroy.
    #[arg(long)]
    event: Option<String>,
}

#[derive(Debug, Args)]
struct TrailShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct TrailStateAtArgs {
    #[arg(long)]
    item_type: String,
    #[arg(long)]
    item_id: String,
    #[arg(long)]
    at: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let options = StoreOptions {
        table: cli.table.clone(),
        timestamp_column: cli.timestamp_column.clone(),
        track_changes: !cli.no_changes_column,
    };
    let mut store = RevisionStore::open_with(&cli.db, options)?;

    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Trail { command } => run_trail(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut RevisionStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &RevisionStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "table": status.table,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut RevisionStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_export(args: &DbExportArgs, store: &mut RevisionStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_trail(&args.out)?;

    let signature = if let Some(key_path) = args.signing_key_file.as_ref() {
        let signing_key = read_hex_key_file(key_path)?;
        let manifest_path = args.out.join(MANIFEST_FILE);
        let manifest_bytes = fs::read(&manifest_path)
            .with_context(|| format!("failed to read manifest file {}", manifest_path.display()))?;
        write_manifest_signature(&args.out, &manifest_bytes, &signing_key)?;
        Some(SIGNATURE_ALGORITHM)
    } else {
        remove_if_exists(&args.out.join(MANIFEST_SIG_FILE))?;
        None
    };

    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest,
        "signature_algorithm": signature
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut RevisionStore) -> Result<()> {
    let verify_key =
        args.verify_key_file.as_ref().map(|path| read_hex_key_file(path)).transpose()?;
    verify_import_input(&args.input, verify_key.as_ref(), args.allow_unsigned)?;

    let summary = store.import_trail(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut RevisionStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut RevisionStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &RevisionStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_trail(command: TrailCommand, store: &mut RevisionStore) -> Result<()> {
    store.migrate()?;
    match command {
        TrailCommand::List(args) => {
            let item_id = ItemId::new(args.item_id);
            let mut revisions = store.for_item(&args.item_type, &item_id)?;
            if let Some(event_raw) = args.event.as_deref() {
                let event = revision_kernel_core::RevisionEvent::parse(event_raw)
                    .ok_or_else(|| anyhow!("unknown event filter: {event_raw}"))?;
                revisions.retain(|revision| revision.event == event);
            }
            emit_json(serde_json::json!({ "revisions": revisions }))
        }
        TrailCommand::Show(args) => {
            let revision = load_revision(store, args.id)?;
            let index = store.index_of(&revision)?;
            let snapshot = revision
                .snapshot()?
                .map(|attributes| serde_json::to_value(&attributes))
                .transpose()
                .context("failed to serialize decoded snapshot")?;
            emit_json(serde_json::json!({
                "revision": revision,
                "index": index,
                "decoded_object": snapshot
            }))
        }
        TrailCommand::Changeset(args) => {
            let revision = load_revision(store, args.id)?;
            match store.changeset(&revision)? {
                Some(changes) => emit_json(serde_json::json!({
                    "supported": true,
                    "changeset": changes
                })),
                None => emit_json(serde_json::json!({
                    "supported": false,
                    "changeset": Value::Null
                })),
            }
        }
        TrailCommand::StateAt(args) => {
            let at = parse_rfc3339(&args.at)?;
            let item_id = ItemId::new(args.item_id);
            let following = store.following(&args.item_type, &item_id, at)?;
            match following.first() {
                None => emit_json(serde_json::json!({ "status": "live" })),
                Some(revision) => match revision.object.as_deref() {
                    None => emit_json(serde_json::json!({ "status": "absent" })),
                    Some(raw) => {
                        let attributes = decode_snapshot(raw)?;
                        emit_json(serde_json::json!({
                            "status": "historical",
                            "source_revision_id": revision.id,
                            "attributes": attributes
                        }))
                    }
                },
            }
        }
    }
}

fn load_revision(store: &RevisionStore, id: i64) -> Result<Revision> {
    store
        .get(RevisionId(id))?
        .ok_or_else(|| anyhow!("revision not found: {id}"))
}

fn read_hex_key_file(path: &Path) -> Result<[u8; 32]> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let trimmed = body.trim();
    let bytes = hex::decode(trimmed)
        .with_context(|| format!("key file must contain hex bytes: {}", path.display()))?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "key file {} must decode to exactly 32 bytes (got {})",
            path.display(),
            bytes.len()
        ));
    }

    let mut key = [0_u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}

fn write_manifest_signature(out_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature key: {err}"))?;
    mac.update(manifest_bytes);
    let signature_hex = hex::encode(mac.finalize().into_bytes());
    let signature_path = out_dir.join(MANIFEST_SIG_FILE);
    fs::write(&signature_path, signature_hex)
        .with_context(|| format!("failed to write manifest signature {}", signature_path.display()))
}

fn verify_manifest_signature(in_dir: &Path, manifest_bytes: &[u8], key: &[u8; 32]) -> Result<()> {
    let signature_path = in_dir.join(MANIFEST_SIG_FILE);
    let signature_body = fs::read_to_string(&signature_path).with_context(|| {
        format!("failed to read manifest signature file {}", signature_path.display())
    })?;
    let signature = hex::decode(signature_body.trim()).with_context(|| {
        format!("manifest signature file is not valid hex: {}", signature_path.display())
    })?;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| anyhow!("failed to initialize signature verification key: {err}"))?;
    mac.update(manifest_bytes);
    mac.verify_slice(&signature).map_err(|_| {
        anyhow!("manifest signature verification failed for {}", signature_path.display())
    })
}

fn verify_import_input(
    input_dir: &Path,
    verify_key: Option<&[u8; 32]>,
    allow_unsigned: bool,
) -> Result<()> {
    let manifest_path = input_dir.join(MANIFEST_FILE);
    let manifest_bytes = fs::read(&manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;

    // Parse to catch a corrupt manifest before any verification decision.
    let _: ExportManifest = serde_json::from_slice(&manifest_bytes)
        .with_context(|| format!("failed to parse manifest {}", manifest_path.display()))?;

    let signature_path = input_dir.join(MANIFEST_SIG_FILE);
    if signature_path.exists() {
        let key = verify_key.ok_or_else(|| {
            anyhow!(
                "trail export is signed; provide --verify-key-file to verify {}",
                signature_path.display()
            )
        })?;
        verify_manifest_signature(input_dir, &manifest_bytes, key)?;
    } else if !allow_unsigned {
        return Err(anyhow!(
            "trail export is unsigned; rerun with --allow-unsigned for explicit override"
        ));
    }

    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("failed to remove file {}", path.display()))?;
    }
    Ok(())
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
