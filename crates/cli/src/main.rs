//! Command-line client for resumable uploads.

mod api_client;
mod transfer;

use anyhow::{Context, Result, bail};
use api_client::ApiClient;
use clap::{Args, Parser, Subcommand, ValueEnum};
use porter_core::upload::{CreateUploadRequest, UploadStateResponse};
use porter_core::{UploadKind, UploadMetadata};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transfer::TransferOptions;

#[derive(Parser)]
#[command(name = "porter")]
#[command(about = "Resumable uploads to a porter server")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    api: ApiArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ApiArgs {
    /// Server API URL
    #[arg(long, global = true, env = "PORTER_SERVER", default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Owner identity sent with every request
    #[arg(long, global = true, env = "PORTER_OWNER")]
    owner: Option<String>,

    /// Header carrying the owner identity
    #[arg(long, global = true, env = "PORTER_OWNER_HEADER", default_value = api_client::DEFAULT_OWNER_HEADER)]
    owner_header: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Create,
    Update,
}

impl From<KindArg> for UploadKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Create => UploadKind::CreateResource,
            KindArg::Update => UploadKind::UpdateResource,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a file: create a session, send it in chunks and complete it
    Upload {
        file: PathBuf,
        /// Create a new resource or replace the file of an existing one
        #[arg(long, value_enum, default_value = "create")]
        kind: KindArg,
        /// Resource to update (required with --kind update)
        #[arg(long)]
        resource_id: Option<String>,
        /// Descriptive metadata as key=value, repeatable
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        meta: Vec<String>,
        /// Requested session lifetime in seconds
        #[arg(long)]
        expires_in: Option<u64>,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Continue an interrupted upload from the server's offset
    Resume {
        upload_id: String,
        file: PathBuf,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Show a session's state
    Status { upload_id: String },
    /// Cancel a session
    Cancel { upload_id: String },
    /// Push a session's deadline out
    Extend {
        upload_id: String,
        /// New lifetime from now, in seconds
        expires_in: u64,
    },
    /// Check whether a new upload would be admitted
    Slots,
    /// List your sessions, newest first
    List {
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[derive(Args, Clone, Copy)]
struct TransferArgs {
    /// Bytes per chunk
    #[arg(long, default_value_t = transfer::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    /// Consecutive failures tolerated before giving up
    #[arg(long, default_value_t = transfer::MAX_RETRIES)]
    max_retries: u32,
}

impl From<TransferArgs> for TransferOptions {
    fn from(args: TransferArgs) -> Self {
        Self {
            chunk_size: args.chunk_size,
            max_retries: args.max_retries,
            ..Self::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Cli { api, command } = Cli::parse();
    let client = get_api_client(&api)?;

    match command {
        Commands::Upload {
            file,
            kind,
            resource_id,
            meta,
            expires_in,
            transfer,
        } => {
            let req = CreateUploadRequest {
                kind: kind.into(),
                total_size: file_len(&file).await?,
                metadata: parse_metadata(&meta)?,
                resource_id,
                expires_in_secs: expires_in,
            };
            handle_upload_command(&client, &file, req, transfer.into()).await
        }
        Commands::Resume {
            upload_id,
            file,
            transfer,
        } => handle_resume_command(&client, &upload_id, &file, transfer.into()).await,
        Commands::Status { upload_id } => {
            let state = client.get_upload(&upload_id).await?;
            print_state(&state);
            Ok(())
        }
        Commands::Cancel { upload_id } => {
            let response = client.cancel_upload(&upload_id).await?;
            if response.already_terminal {
                println!("Upload {} was already {}", response.upload_id, response.status);
            } else {
                println!("Cancelled upload {}", response.upload_id);
            }
            Ok(())
        }
        Commands::Extend {
            upload_id,
            expires_in,
        } => {
            let state = client.extend_upload(&upload_id, expires_in).await?;
            print_state(&state);
            Ok(())
        }
        Commands::Slots => {
            let slots = client.slots().await?;
            println!(
                "{} ({} active, {} queued, limit {})",
                if slots.available { "Slot available" } else { "No slot available" },
                slots.active,
                slots.queue_length,
                slots.max_concurrent
            );
            Ok(())
        }
        Commands::List { limit } => {
            let response = client.list_uploads(limit).await?;
            if response.uploads.is_empty() {
                println!("No uploads");
            }
            for state in &response.uploads {
                println!(
                    "{}  {:<10} {:>6.1}%  {}/{} bytes",
                    state.upload_id,
                    state.status.as_str(),
                    state.progress,
                    state.offset,
                    state.length
                );
            }
            Ok(())
        }
    }
}

fn get_api_client(api: &ApiArgs) -> Result<ApiClient> {
    let owner = api
        .owner
        .as_deref()
        .filter(|o| !o.trim().is_empty())
        .context("no owner given; pass --owner or set PORTER_OWNER")?;
    Ok(ApiClient::new(&api.server, owner)?.with_owner_header(&api.owner_header))
}

async fn file_len(path: &Path) -> Result<u64> {
    Ok(tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?
        .len())
}

fn parse_metadata(pairs: &[String]) -> Result<UploadMetadata> {
    let mut metadata = UploadMetadata::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid metadata '{pair}', expected KEY=VALUE");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("invalid metadata '{pair}', key is empty");
        }
        metadata.insert(key.to_string(), value.into());
    }
    Ok(metadata)
}

async fn handle_upload_command(
    client: &ApiClient,
    file: &Path,
    req: CreateUploadRequest,
    options: TransferOptions,
) -> Result<()> {
    let created = client.create_upload(&req).await?;
    eprintln!("Created upload {} ({})", created.upload_id, created.status);
    finish_upload(client, &created.upload_id, file, created.offset, options).await
}

async fn handle_resume_command(
    client: &ApiClient,
    upload_id: &str,
    file: &Path,
    options: TransferOptions,
) -> Result<()> {
    let state = client.get_upload(upload_id).await?;
    let len = file_len(file).await?;
    if state.length != len {
        bail!(
            "{} is {len} bytes but upload {upload_id} expects {}",
            file.display(),
            state.length
        );
    }
    eprintln!(
        "Resuming upload {upload_id} at {}/{} bytes",
        state.offset, state.length
    );
    finish_upload(client, upload_id, file, state.offset, options).await
}

async fn finish_upload(
    client: &ApiClient,
    upload_id: &str,
    file: &Path,
    offset: u64,
    options: TransferOptions,
) -> Result<()> {
    let offset = transfer::send_file(client, upload_id, file, offset, options)
        .await
        .with_context(|| {
            format!("upload interrupted; continue with `porter resume {upload_id} <file>`")
        })?;
    eprintln!("Sent {offset} bytes, completing");

    let done = transfer::complete(client, upload_id, options).await?;
    println!(
        "Upload {} completed: resource {} at {}",
        done.upload_id, done.resource_id, done.storage_path
    );
    Ok(())
}

fn print_state(state: &UploadStateResponse) {
    println!("Upload:     {}", state.upload_id);
    println!("Status:     {}", state.status);
    println!(
        "Progress:   {:.1}% ({}/{} bytes)",
        state.progress, state.offset, state.length
    );
    if let Some(resource_id) = &state.resource_id {
        println!("Resource:   {resource_id}");
    }
    println!("Expires at: {}", state.expires_at);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_pairs_are_parsed() {
        let metadata =
            parse_metadata(&["title=Site plan".to_string(), "category=drawings".to_string()])
                .unwrap();
        assert_eq!(metadata["title"], "Site plan");
        assert_eq!(metadata["category"], "drawings");

        assert!(parse_metadata(&["no-separator".to_string()]).is_err());
        assert!(parse_metadata(&["=value".to_string()]).is_err());
    }

    #[test]
    fn owner_is_required() {
        let api = ApiArgs {
            server: "http://localhost:8080".to_string(),
            owner: None,
            owner_header: api_client::DEFAULT_OWNER_HEADER.to_string(),
        };
        assert!(get_api_client(&api).is_err());
    }

    #[test]
    fn cli_parses_upload() {
        let cli = Cli::try_parse_from([
            "porter",
            "--owner",
            "alice",
            "upload",
            "report.pdf",
            "--kind",
            "update",
            "--resource-id",
            "doc-7",
            "--meta",
            "title=Report",
            "--chunk-size",
            "1024",
        ])
        .unwrap();
        let Commands::Upload {
            kind,
            resource_id,
            meta,
            transfer,
            ..
        } = cli.command
        else {
            panic!("expected upload");
        };
        assert!(matches!(kind, KindArg::Update));
        assert_eq!(resource_id.as_deref(), Some("doc-7"));
        assert_eq!(meta, vec!["title=Report"]);
        assert_eq!(transfer.chunk_size, 1024);
    }
}
