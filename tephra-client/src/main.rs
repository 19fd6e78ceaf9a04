use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

use tephra_blte::KeyRing;
use tephra_client::{BuildSession, SessionConfig};
use tephra_formats::root::LocaleFlags;
use tephra_formats::{CKey, EKey};

#[derive(Parser)]
#[command(
    name = "tephra",
    about = "Content-addressed game content extraction client",
    version,
    long_about = "Resolves file identifiers through the root, encoding, and archive \
                  index chain, fetching verified blobs from a local installation, the \
                  disk cache, or a ranked pool of CDN mirrors."
)]
struct Cli {
    /// Product code
    #[arg(long, default_value = "wow")]
    product: String,

    /// Service region
    #[arg(long, default_value = "us")]
    region: String,

    /// Locale whose root pages are used
    #[arg(long, default_value = "enUS")]
    locale: String,

    /// Disk cache directory
    #[arg(long = "cacheDirectory", default_value = "cache")]
    cache_directory: PathBuf,

    /// Base directory of a local installation
    #[arg(long = "baseDirectory")]
    base_directory: Option<PathBuf>,

    /// Build configuration hash (skips the versions service)
    #[arg(long = "buildConfig")]
    build_config: Option<String>,

    /// CDN configuration hash (skips the versions service)
    #[arg(long = "cdnConfig")]
    cdn_config: Option<String>,

    /// File of `keyname keyhex` encryption keys
    #[arg(long)]
    keys: Option<PathBuf>,

    /// Where to write the extracted file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Logging level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract a file by its numeric file data ID
    #[command(name = "extractFileDataID")]
    ExtractFileDataId { file_data_id: u32 },

    /// Extract a file by its 16-byte content key (hex)
    #[command(name = "extractContentKey")]
    ExtractContentKey { content_key: String },

    /// Extract a blob by its 16-byte encoding key (hex)
    #[command(name = "extractEncodingKey")]
    ExtractEncodingKey { encoding_key: String },

    /// Extract a file by its virtual path
    #[command(name = "extractFileName")]
    ExtractFileName { file_name: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let Some(locale) = LocaleFlags::named(&cli.locale) else {
        return Err(format!("unknown locale {:?}", cli.locale).into());
    };

    let mut keys = KeyRing::new();
    if let Some(path) = &cli.keys {
        keys.load_file(path)?;
    }

    let config = SessionConfig {
        region: cli.region.clone(),
        locale,
        cache_dir: cli.cache_directory.clone(),
        base_dir: cli.base_directory.clone(),
        build_config: cli.build_config.clone(),
        cdn_config: cli.cdn_config.clone(),
        keys,
        ..SessionConfig::new(cli.product.clone())
    };

    let session = BuildSession::open(config).await?;

    let (bytes, default_name) = match &cli.command {
        Command::ExtractFileDataId { file_data_id } => (
            session.extract_by_fdid(*file_data_id).await?,
            format!("{file_data_id}.bin"),
        ),
        Command::ExtractContentKey { content_key } => {
            let ckey = CKey::from_hex(content_key)?;
            (session.extract_by_ckey(&ckey).await?, format!("{ckey}.bin"))
        }
        Command::ExtractEncodingKey { encoding_key } => {
            let ekey = EKey::from_hex(encoding_key)?;
            (session.fetch_by_ekey(&ekey, 0).await?, format!("{ekey}.bin"))
        }
        Command::ExtractFileName { file_name } => {
            let flat = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
            (session.extract_by_name(file_name).await?, flat.to_string())
        }
    };

    let output = cli.output.unwrap_or_else(|| PathBuf::from(default_name));
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(&output, &bytes)?;
    println!("{} bytes written to {}", bytes.len(), output.display());

    Ok(())
}
