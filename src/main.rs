//! Thin CLI glue (C6): parses the positional `<LocalPath> <S3Uri>` plus
//! the upload flags, builds an `UploadConfig`, and hands control to the
//! library's `run()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use s3drip::config::UploadConfig;
use s3drip::coordinator;
use s3drip::input::{InputDispatcher, Key, MfaPromptFlag};
use s3drip::s3::AwsS3Client;

/// Upload a single local file to S3 using a resumable multipart upload.
#[derive(Parser, Debug)]
#[command(name = "s3drip")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Local file to upload
    local_path: PathBuf,

    /// Destination, as s3://<bucket>/<key>
    s3_uri: String,

    /// Override the auto-selected part size, in bytes
    #[arg(long)]
    part_size: Option<u64>,

    /// Initial rate limit in bytes/s (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rate: u64,

    /// Path to a weekly rate schedule file
    #[arg(long)]
    schedule: Option<PathBuf>,

    /// Skip the existence check and overwrite the destination
    #[arg(long)]
    force: bool,

    /// Compute and record a SHA-256 checksum if SHA256SUMS has no entry
    #[arg(long)]
    compute_checksum: bool,

    /// Content-Type to attach to the uploaded object
    #[arg(long)]
    content_type: Option<String>,

    /// Storage class to request
    #[arg(long)]
    storage_class: Option<String>,

    /// Server-side encryption mode
    #[arg(long)]
    sse: Option<String>,

    /// SSE-KMS key id
    #[arg(long)]
    sse_kms_key_id: Option<String>,

    /// Comma-separated object tags, URL-encoded (`key1=val1&key2=val2`)
    #[arg(long)]
    tags: Option<String>,

    /// User metadata, repeatable, `key=value`
    #[arg(long, value_parser = parse_key_val)]
    metadata: Vec<(String, String)>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("invalid KEY=VALUE: {s:?}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Explicit builder (rather than `#[tokio::main]`) so the part-upload
    // task and the blocking file-read path get a predictable thread
    // budget, mirroring the proxy's own manual runtime construction.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("s3drip=trace")
        } else {
            EnvFilter::new("s3drip=info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (bucket, key) = UploadConfig::parse_s3_uri(&cli.s3_uri)?;

    let config = UploadConfig {
        bucket,
        key,
        local_path: cli.local_path,
        part_size_override: cli.part_size,
        initial_rate: cli.rate,
        schedule_path: cli.schedule,
        force: cli.force,
        compute_checksum: cli.compute_checksum,
        content_type: cli.content_type,
        storage_class: cli.storage_class,
        server_side_encryption: cli.sse,
        sse_kms_key_id: cli.sse_kms_key_id,
        tags: cli.tags,
        metadata: cli.metadata.into_iter().collect::<HashMap<_, _>>(),
        checksum_algorithm: None,
        legal_hold: None,
        retain_until: None,
        request_payer: None,
        expected_bucket_owner: None,
        dualstack: std::env::var("AWS_USE_DUALSTACK_ENDPOINT")
            .map(|v| v == "true")
            .unwrap_or(false),
        accelerate: false,
        path_style: false,
    };

    info!("uploading {} to s3://{}/{}", config.local_path.display(), config.bucket, config.key);

    let client = Arc::new(AwsS3Client::from_env().await);

    let (keys_tx, keys_rx) = mpsc::channel::<Key>(1);
    let (mfa_tx, _mfa_rx) = mpsc::channel::<String>(1);
    let mfa_flag = MfaPromptFlag::new();
    let dispatcher = InputDispatcher::new(std::io::stdin(), mfa_flag);
    tokio::spawn(dispatcher.run(keys_tx, mfa_tx));

    match coordinator::run(config, client, keys_rx).await {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}
