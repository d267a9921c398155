//! imprint CLI - commit working containers to images and push them elsewhere

use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use imprint::ops::{CommitOptions, CommitPath, Engine, PushOptions};
use imprint::transport::{expand_tags, parse_reference, ImageReference};
use imprint::types::ManifestType;
use imprint::{
    add_image_names, images_matching, Builder, Compression, Config, FsStore, IoResultExt, Store,
};

#[derive(Parser)]
#[command(name = "imprint")]
#[command(about = "commit working containers to images and export them")]
#[command(version)]
struct Cli {
    /// store path
    #[arg(short, long, env = "IMPRINT_ROOT", default_value = ".")]
    root: PathBuf,

    /// debug logging (otherwise IMPRINT_LOG, default warn)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// initialize a new store
    Init {
        /// path to create the store at
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// create a working container from an image (or `scratch`)
    From {
        /// image name or id
        image: String,
    },

    /// replace a container's changes with the contents of a (possibly compressed) tar
    Add {
        /// container id or name
        container: String,

        /// tar file
        archive: PathBuf,
    },

    /// change the configuration a container will be committed with
    Config {
        /// container id or name
        container: String,

        /// command, as separate arguments
        #[arg(long, num_args = 1..)]
        cmd: Option<Vec<String>>,

        /// entrypoint, as separate arguments
        #[arg(long, num_args = 1..)]
        entrypoint: Option<Vec<String>>,

        /// environment variable (KEY=VALUE), repeatable
        #[arg(short, long)]
        env: Vec<String>,

        /// label (KEY=VALUE), repeatable
        #[arg(short, long)]
        label: Vec<String>,

        #[arg(long)]
        workingdir: Option<String>,

        #[arg(short, long)]
        user: Option<String>,

        #[arg(long)]
        author: Option<String>,

        /// history text for the next commit
        #[arg(long)]
        created_by: Option<String>,
    },

    /// commit a container to an image
    Commit {
        /// container id or name
        container: String,

        /// destination: NAME, containers-storage:NAME, dir:PATH, docker://NAME or a remote
        destination: String,

        /// additional names, repeatable
        #[arg(short, long)]
        tag: Vec<String>,

        /// manifest type: oci, docker
        #[arg(long)]
        manifest_type: Option<String>,

        /// layer compression: uncompressed, gzip, zstd
        #[arg(long)]
        compression: Option<String>,

        /// signature policy file
        #[arg(long)]
        signature_policy: Option<PathBuf>,

        /// timestamp for the history entry (RFC 3339)
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,

        /// don't print copy progress
        #[arg(short, long)]
        quiet: bool,
    },

    /// copy an image to another destination
    Push {
        /// image name or id
        image: String,

        /// destination: dir:PATH, docker://NAME or a remote
        destination: String,

        /// manifest type: oci, docker
        #[arg(long)]
        manifest_type: Option<String>,

        /// layer compression: uncompressed, gzip, zstd
        #[arg(long)]
        compression: Option<String>,

        /// signature policy file
        #[arg(long)]
        signature_policy: Option<PathBuf>,

        /// don't print copy progress
        #[arg(short, long)]
        quiet: bool,
    },

    /// list images
    Images {
        /// only names matching this glob pattern
        pattern: Option<String>,
    },

    /// add names to an image
    Tag {
        /// image name or id
        image: String,

        /// names to add
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// remove an image
    Rmi {
        /// image name or id
        image: String,
    },

    /// print an image's configuration
    Inspect {
        /// image name or id
        image: String,
    },

    /// manage named destinations
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[derive(Subcommand)]
enum RemoteCommands {
    /// add a named destination
    Add {
        name: String,
        destination: String,
    },

    /// remove a named destination
    Rm { name: String },

    /// list named destinations
    List,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli) {
        eprintln!("error: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("IMPRINT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> imprint::Result<()> {
    match cli.command {
        Commands::Init { path } => {
            FsStore::init(&path)?;
            println!("initialized imprint store at {}", path.display());
        }

        Commands::From { image } => {
            let store = FsStore::open(&cli.root)?;
            let builder = Builder::new(&store, &image)?;
            println!("{}", builder.container_id()?);
        }

        Commands::Add { container, archive } => {
            let store = FsStore::open(&cli.root)?;
            let container = store.container(&container)?;
            let file = File::open(&archive).with_path(&archive)?;
            let layer = store.set_layer_diff(&container.layer_id, &mut BufReader::new(file))?;
            println!("{} {} bytes", layer.diff_digest, layer.diff_size);
        }

        Commands::Config {
            container,
            cmd,
            entrypoint,
            env,
            label,
            workingdir,
            user,
            author,
            created_by,
        } => {
            let store = FsStore::open(&cli.root)?;
            let mut builder = Builder::load(&store, &container)?;

            if let Some(cmd) = cmd {
                builder.config.cmd = cmd;
            }
            if let Some(entrypoint) = entrypoint {
                builder.config.entrypoint = entrypoint;
            }
            for var in env {
                set_env(&mut builder.config.env, var);
            }
            for kv in label {
                let (key, value) = kv.split_once('=').unwrap_or((kv.as_str(), ""));
                builder.config.labels.insert(key.to_string(), value.to_string());
            }
            if workingdir.is_some() {
                builder.config.working_dir = workingdir;
            }
            if user.is_some() {
                builder.config.user = user;
            }
            if author.is_some() {
                builder.author = author;
            }
            if created_by.is_some() {
                builder.created_by = created_by;
            }

            builder.save(&store)?;
        }

        Commands::Commit {
            container,
            destination,
            tag,
            manifest_type,
            compression,
            signature_policy,
            timestamp,
            quiet,
        } => {
            let store = FsStore::open(&cli.root)?;
            let config = store.config();
            let builder = Builder::load(&store, &container)?;
            let dest = resolve_destination(config, &destination)?;

            let options = CommitOptions {
                manifest_type: manifest_type_or_default(config, manifest_type.as_deref())?,
                compression: compression_or_default(config, compression.as_deref())?,
                signature_policy_path: signature_policy
                    .or_else(|| config.defaults.signature_policy_path.clone()),
                additional_tags: tag,
                report_writer: report_writer(quiet),
                history_timestamp: timestamp,
            };
            let report = Engine::new(&store).commit(&builder, &dest, options)?;

            match (report.path, report.image_id) {
                (CommitPath::Shallow, Some(id)) => println!("{}", id),
                _ => println!("committed to {}", dest),
            }
        }

        Commands::Push {
            image,
            destination,
            manifest_type,
            compression,
            signature_policy,
            quiet,
        } => {
            let store = FsStore::open(&cli.root)?;
            let config = store.config();
            let dest = resolve_destination(config, &destination)?;

            let options = PushOptions {
                compression: compression_or_default(config, compression.as_deref())?,
                manifest_type: manifest_type_or_default(config, manifest_type.as_deref())?,
                signature_policy_path: signature_policy
                    .or_else(|| config.defaults.signature_policy_path.clone()),
                report_writer: report_writer(quiet),
            };
            Engine::new(&store).push(&image, &dest, options)?;
            println!("pushed {} to {}", image, dest);
        }

        Commands::Images { pattern } => {
            let store = FsStore::open(&cli.root)?;
            let images = match pattern {
                Some(pattern) => images_matching(&store, &pattern)?,
                None => store.images()?,
            };

            for image in images {
                let short = &image.id[..12.min(image.id.len())];
                if image.names.is_empty() {
                    println!("{} <none>", short);
                }
                for name in &image.names {
                    println!("{} {}", short, name);
                }
            }
        }

        Commands::Tag { image, names } => {
            let store = FsStore::open(&cli.root)?;
            let image = ImageReference::storage(&image).resolve_image(&store)?;
            let names = expand_tags(&names)?;
            add_image_names(&store, &image, &names)?;
        }

        Commands::Rmi { image } => {
            let store = FsStore::open(&cli.root)?;
            let record = ImageReference::storage(&image).resolve_image(&store)?;
            let layers = store.delete_image(&record.id, true)?;
            println!("{} ({} layers removed)", record.id, layers.len());
        }

        Commands::Inspect { image } => {
            let store = FsStore::open(&cli.root)?;
            let builder = Builder::import_from_image(&store, &image)?;
            let json = serde_json::to_string_pretty(&builder)?;
            println!("{}", json);
        }

        Commands::Remote { command } => {
            let mut store = FsStore::open(&cli.root)?;

            match command {
                RemoteCommands::Add { name, destination } => {
                    parse_reference(&destination)?;
                    store.config_mut().add_remote(name, destination)?;
                    store.save_config()?;
                }
                RemoteCommands::Rm { name } => {
                    store.config_mut().remove_remote(&name)?;
                    store.save_config()?;
                }
                RemoteCommands::List => {
                    for remote in &store.config().remotes {
                        println!("{} {}", remote.name, remote.destination);
                    }
                }
            }
        }
    }

    Ok(())
}

/// a remote name, or a reference string
fn resolve_destination(config: &Config, destination: &str) -> imprint::Result<ImageReference> {
    parse_reference(config.resolve_destination(destination))
}

fn manifest_type_or_default(config: &Config, s: Option<&str>) -> imprint::Result<ManifestType> {
    match s {
        Some(s) => s.parse(),
        None => Ok(config.defaults.manifest_type),
    }
}

fn compression_or_default(config: &Config, s: Option<&str>) -> imprint::Result<Compression> {
    match s {
        Some(s) => s.parse(),
        None => Ok(config.defaults.compression),
    }
}

fn report_writer(quiet: bool) -> Option<Box<dyn Write + Send>> {
    if quiet {
        None
    } else {
        Some(Box::new(io::stderr()))
    }
}

/// set KEY=VALUE, replacing an existing KEY
fn set_env(env: &mut Vec<String>, var: String) {
    let key = var.split_once('=').map(|(k, _)| k).unwrap_or(&var).to_string();
    env.retain(|e| e.split_once('=').map(|(k, _)| k).unwrap_or(e) != key);
    env.push(var);
}
