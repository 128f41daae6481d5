use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use zbus::proxy;

#[proxy(
    interface = "io.presence.Engine1",
    default_service = "io.presence.Engine1",
    default_path = "/io/presence/Engine1"
)]
trait Engine {
    fn enroll(&self, identity: &str, image_path: &str, replace: bool) -> zbus::Result<String>;
    fn enroll_capture(&self, identity: &str, replace: bool) -> zbus::Result<String>;
    fn enroll_remote(&self, identity: &str, url: &str) -> zbus::Result<String>;
    fn backfill(&self, candidates_json: &str) -> zbus::Result<String>;
    fn verify(&self) -> zbus::Result<String>;
    fn verify_image(&self, path: &str) -> zbus::Result<String>;
    fn verify_identity(&self, identity: &str) -> zbus::Result<String>;
    fn verify_identity_image(&self, identity: &str, path: &str) -> zbus::Result<String>;
    fn list_entries(&self, identity: &str) -> zbus::Result<String>;
    fn remove_identity(&self, identity: &str) -> zbus::Result<u32>;
    fn open_capture(&self) -> zbus::Result<()>;
    fn release(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance terminal CLI")]
struct Cli {
    /// Talk to the daemon on the session bus instead of the system bus
    #[arg(long, global = true, env = "PRESENCE_SESSION_BUS")]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll an identity from an image file, or from the camera when no image is given
    Enroll {
        /// Employee identifier
        identity: String,
        /// Image containing exactly one face
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Replace previously enrolled descriptors
        #[arg(long)]
        replace: bool,
    },
    /// Enroll through the vectorization service from an https image URL
    EnrollRemote { identity: String, url: String },
    /// Vectorize every not-yet-enrolled identity listed in a JSON file
    Backfill {
        /// JSON array of {"identity": ..., "url": ...}
        file: PathBuf,
    },
    /// Verify the face in front of the camera, or in an image file
    Verify {
        #[arg(short, long)]
        image: Option<PathBuf>,
        /// Only accept a match with this identity's descriptors
        #[arg(long = "as", value_name = "IDENTITY")]
        claim: Option<String>,
    },
    /// List enrolled descriptors of an identity
    List { identity: String },
    /// Remove every descriptor of an identity
    Remove { identity: String },
    /// Open (or retry opening) the camera
    Open,
    /// Release the camera
    Release,
    /// Show daemon status
    Status,
}

fn absolute(path: &Path) -> Result<String> {
    let path = std::fs::canonicalize(path).with_context(|| format!("{}", path.display()))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot reach D-Bus")?;
    let engine = EngineProxy::new(&connection)
        .await
        .context("presenced is not reachable")?;
    tracing::debug!(session = cli.session, "connected to presenced");

    match cli.command {
        Commands::Enroll {
            identity,
            image,
            replace,
        } => {
            let reply = match image {
                Some(image) => engine.enroll(&identity, &absolute(&image)?, replace).await?,
                None => {
                    println!("Look at the camera...");
                    engine.enroll_capture(&identity, replace).await?
                }
            };
            print_json(&reply)?;
        }
        Commands::EnrollRemote { identity, url } => {
            let vector_id = engine.enroll_remote(&identity, &url).await?;
            println!("Enrolled {identity}: vector {vector_id}");
        }
        Commands::Backfill { file } => {
            let candidates = std::fs::read_to_string(&file)
                .with_context(|| format!("{}", file.display()))?;
            print_json(&engine.backfill(&candidates).await?)?;
        }
        Commands::Verify { image, claim } => {
            let reply = match (image, claim) {
                (Some(image), Some(claim)) => {
                    engine
                        .verify_identity_image(&claim, &absolute(&image)?)
                        .await?
                }
                (Some(image), None) => engine.verify_image(&absolute(&image)?).await?,
                (None, Some(claim)) => engine.verify_identity(&claim).await?,
                (None, None) => engine.verify().await?,
            };
            print_json(&reply)?;
        }
        Commands::List { identity } => {
            let entries: Vec<serde_json::Value> =
                serde_json::from_str(&engine.list_entries(&identity).await?)?;
            if entries.is_empty() {
                println!("No descriptors enrolled for {identity}");
            }
            for entry in entries {
                println!(
                    "{}  {}  dim={}",
                    entry["id"].as_str().unwrap_or("?"),
                    entry["enrolled_at"].as_str().unwrap_or("?"),
                    entry["dimension"]
                );
            }
        }
        Commands::Remove { identity } => {
            let removed = engine.remove_identity(&identity).await?;
            println!("Removed {removed} descriptor(s) of {identity}");
        }
        Commands::Open => {
            engine.open_capture().await?;
            println!("Camera open");
        }
        Commands::Release => {
            engine.release().await?;
            println!("Camera released");
        }
        Commands::Status => print_json(&engine.status().await?)?,
    }

    Ok(())
}
