use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blobgate::{config, BlobStorage};

/// Object storage gateway smoke tool / 对象存储网关工具
#[derive(Parser)]
#[command(name = "blobgate", version, long_version = concat!(env!("CARGO_PKG_VERSION"), " (built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Config file (JSON); BLOBGATE_* env vars override it / 配置文件
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Bucket to use instead of the configured default / 存储桶
    #[arg(long, global = true)]
    bucket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a local file / 上传本地文件
    Put {
        key: String,
        file: PathBuf,
        #[arg(long)]
        overwrite: bool,
        /// Use the multipart protocol / 使用分片上传
        #[arg(long)]
        multipart: bool,
    },
    /// Download an object / 下载对象
    Get {
        key: String,
        /// Output file, stdout when omitted / 输出文件
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete an object / 删除对象
    Rm { key: String },
    /// List keys under a prefix / 列出对象
    Ls {
        prefix: Option<String>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print a direct or presigned URL / 获取访问URL
    Url {
        key: String,
        /// Presigned validity in seconds, 0 for a direct URL / 预签名有效期
        #[arg(long, default_value_t = 0)]
        expiry: u32,
        #[arg(long)]
        insecure: bool,
    },
    /// Check whether an object exists / 检查对象是否存在
    Exists { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blobgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config)?;
    let storage = BlobStorage::new(app_config)?;
    let bucket = cli.bucket.as_deref();

    match cli.command {
        Command::Put {
            key,
            file,
            overwrite,
            multipart,
        } => {
            if multipart {
                let summary = storage.upload_large_file(bucket, &key, &file, overwrite).await?;
                tracing::info!(
                    "Uploaded {:?} as {}: parts={}, bytes={}, skipped={}",
                    file,
                    key,
                    summary.parts,
                    summary.bytes,
                    summary.skipped
                );
            } else {
                storage.upload_from_file_path(bucket, &key, &file, overwrite).await?;
                tracing::info!("Uploaded {:?} as {}", file, key);
            }
        }
        Command::Get { key, output } => {
            let Some(data) = storage.download(bucket, &key).await? else {
                anyhow::bail!("object not found: {}", key);
            };
            match output {
                Some(path) => tokio::fs::write(&path, &data).await?,
                None => {
                    use tokio::io::AsyncWriteExt;
                    let mut stdout = tokio::io::stdout();
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
            }
        }
        Command::Rm { key } => {
            storage.delete(bucket, &key).await?;
        }
        Command::Ls { prefix, page_size } => {
            for key in storage.list_files(bucket, prefix.as_deref(), page_size).await? {
                println!("{}", key);
            }
        }
        Command::Url {
            key,
            expiry,
            insecure,
        } => {
            println!("{}", storage.get_url(bucket, &key, !insecure, expiry).await?);
        }
        Command::Exists { key } => {
            let found = storage.probe(bucket, &key).await?;
            println!("{}", found);
            if !found {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
