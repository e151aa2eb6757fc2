use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facekit_core::{Embedding, ATTR_FULL_NAME, ATTR_NAME, ATTR_UUID};
use facekit_engine::{
    Attributes, RecognitionConfig, RecognitionFacade, SqliteIdentityStore, PARAM_K_NEAREST, PARAM_THRESHOLD,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facekit", about = "facekit face-recognition engine CLI")]
struct Cli {
    /// Override the configured k-NN neighbour count
    #[arg(long, global = true)]
    k_nearest: Option<i64>,
    /// Override the configured similarity threshold (0..1)
    #[arg(long, global = true)]
    threshold: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add an identity (reuses an existing one with the same name)
    Add {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        full_name: Option<String>,
    },
    /// List identities
    List,
    /// Train an identity from a JSON file of embeddings
    Train {
        #[arg(short, long)]
        name: String,
        /// JSON array of embeddings, e.g. [[0.1, 0.2], [0.3, 0.4]]
        #[arg(short, long)]
        embeddings: PathBuf,
        /// Where this training came from
        #[arg(long, default_value = "cli")]
        context: String,
    },
    /// Recognise every embedding in a JSON file
    Recognize {
        #[arg(short, long)]
        embeddings: PathBuf,
    },
    /// Forget training data of one identity, or of all identities
    Clear {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = RecognitionConfig::load().context("loading configuration")?;
    tracing::debug!(db = %config.db_path.display(), mode = ?config.mode, "configuration loaded");

    if let Commands::Config = cli.command {
        println!("{config:#?}");
        return Ok(());
    }

    let store = SqliteIdentityStore::open(&config.db_path)
        .with_context(|| format!("opening identity database {}", config.db_path.display()))?;
    let facade = RecognitionFacade::new(Arc::new(store), config);
    if !facade.is_enabled() {
        bail!("recognition engine is disabled; see log output");
    }
    if let Some(k) = cli.k_nearest {
        facade.set_parameter(PARAM_K_NEAREST, k);
    }
    if let Some(threshold) = cli.threshold {
        facade.set_parameter(PARAM_THRESHOLD, threshold);
    }

    match cli.command {
        Commands::Add { name, full_name } => {
            let mut attributes = Attributes::new();
            attributes.insert(ATTR_NAME.to_string(), name);
            if let Some(full_name) = full_name {
                attributes.insert(ATTR_FULL_NAME.to_string(), full_name);
            }
            let identity = facade
                .add_identity(&attributes)
                .context("adding identity failed")?;
            println!("{}\t{}", identity.id, identity.display_name());
        }
        Commands::List => {
            let identities = facade.all_identities();
            if identities.is_empty() {
                println!("No identities");
            }
            for identity in identities {
                println!(
                    "{}\t{}\t{}",
                    identity.id,
                    identity.display_name(),
                    identity.attribute(ATTR_UUID).unwrap_or("-")
                );
            }
        }
        Commands::Train {
            name,
            embeddings,
            context,
        } => {
            let identity = facade
                .find_identity_by(ATTR_NAME, &name)
                .with_context(|| format!("no identity named {name:?}; add it first"))?;
            let embeddings = read_embeddings(&embeddings)?;
            let trained = facade.train_embeddings(&identity, &embeddings, &context);
            println!(
                "Trained {} with {trained}/{} embeddings ({} total)",
                identity.display_name(),
                embeddings.len(),
                facade.training_size()
            );
        }
        Commands::Recognize { embeddings } => {
            let embeddings = read_embeddings(&embeddings)?;
            for (index, result) in facade.recognize_embeddings(&embeddings).into_iter().enumerate() {
                match result {
                    Some(identity) => println!("{index}\t{}\t{}", identity.id, identity.display_name()),
                    None => println!("{index}\t-\tunknown"),
                }
            }
        }
        Commands::Clear { name: Some(name) } => {
            let identity = facade
                .find_identity_by(ATTR_NAME, &name)
                .with_context(|| format!("no identity named {name:?}"))?;
            facade.clear_training(&[identity.id], "cli");
            println!("Cleared training of {}", identity.display_name());
        }
        Commands::Clear { name: None } => {
            facade.clear_all_training("cli");
            println!("Cleared all training");
        }
        // printed before the store is opened
        Commands::Config => {}
    }

    Ok(())
}

fn read_embeddings(path: &Path) -> Result<Vec<Embedding>> {
    let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&src).with_context(|| format!("parsing embeddings in {}", path.display()))
}
