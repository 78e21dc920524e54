use anyhow::{bail, Result};
use archive_core::persist::{load_meta, load_payloads, save_payloads, IndexPaths};
use archive_core::tokenizer::Tokenizer;
use archive_core::transcript::read_transcripts;
use archive_core::{Corpus, IndexBuilder, INDEX_FORMAT_VERSION};
use clap::{Parser, Subcommand};
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "indexer")]
#[command(about = "Build and check the comic archive search payloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from transcript JSON/JSONL files or a directory of them
    Build {
        /// Input path (file or directory)
        #[arg(long)]
        input: String,
        /// Output directory for the payload files
        #[arg(long)]
        output: String,
        /// Version stamped into both payloads
        #[arg(long, default_value = INDEX_FORMAT_VERSION)]
        version: String,
        /// Also write the single-file archive.json variant
        #[arg(long, default_value_t = false)]
        combined: bool,
    },
    /// Decode a payload directory and check that every posting resolves
    Verify {
        #[arg(long)]
        dir: String,
    },
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { input, output, version, combined } => {
            build_index(&input, &output, &version, combined).map(|_| ())
        }
        Commands::Verify { dir } => verify_index(&dir).map(|_| ()),
    }
}

fn build_index(input: &str, output: &str, version: &str, combined: bool) -> Result<Corpus> {
    let docs = read_transcripts(input)?;
    if docs.is_empty() {
        bail!("no transcripts found under {input}");
    }
    tracing::info!(documents = docs.len(), input, "read transcripts");

    let generated_at = time::OffsetDateTime::now_utc().format(&Rfc3339)?;
    let built = IndexBuilder::new(Tokenizer::default(), version).generated_at(generated_at).build(&docs);
    for bad in &built.skipped {
        tracing::warn!(date = %bad.date, reason = %bad.reason, "skipped malformed transcript");
    }
    let corpus: Corpus = built.into();

    save_payloads(&IndexPaths::new(output), &corpus, combined)?;
    tracing::info!(
        output,
        version,
        documents = corpus.metadata.total_documents,
        words = corpus.metadata.total_words,
        "index build complete"
    );
    Ok(corpus)
}

fn verify_index(dir: &str) -> Result<Corpus> {
    let paths = IndexPaths::new(dir);
    let corpus = load_payloads(&paths)?;
    let meta = load_meta(&paths)?;
    if meta.version != corpus.metadata.version {
        bail!("meta.json version {} does not match payload version {}", meta.version, corpus.metadata.version);
    }

    let dangling: Vec<_> = corpus.index.dates().into_iter().filter(|d| !corpus.store.contains(d)).collect();
    if !dangling.is_empty() {
        bail!("{} indexed dates have no transcript, first {}", dangling.len(), dangling[0]);
    }
    tracing::info!(
        dir,
        version = %corpus.metadata.version,
        documents = corpus.store.len(),
        words = corpus.index.len(),
        first = ?corpus.store.first_date(),
        last = ?corpus.store.last_date(),
        "payloads verified"
    );
    Ok(corpus)
}
