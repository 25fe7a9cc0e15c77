use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doorbell_core::StoreDocument;
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.doorbell.Doorbell1",
    default_service = "org.doorbell.Doorbell1",
    default_path = "/org/doorbell/Doorbell1"
)]
trait Doorbell {
    async fn force_unlock(&self) -> zbus::Result<bool>;
    async fn silence_bell(&self) -> zbus::Result<bool>;
    async fn reset(&self) -> zbus::Result<()>;
    async fn reload_faces(&self) -> zbus::Result<u32>;
    async fn status(&self) -> zbus::Result<String>;
    async fn history(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "doorbell", about = "Doorbell access-control CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Unlock the door for whoever rang
    Unlock,
    /// Silence the ringing bell
    Silence,
    /// Lock the door and silence the bell
    Reset,
    /// Make the daemon re-read the known-face store
    Reload,
    /// Show daemon status
    Status,
    /// Show recent access events
    History,
    /// Maintain the known-face store
    Faces {
        /// Store file (default: $DOORBELL_FACE_STORE or the XDG data dir)
        #[arg(long, global = true)]
        store: Option<PathBuf>,

        #[command(subcommand)]
        command: FacesCommand,
    },
}

#[derive(Subcommand)]
enum FacesCommand {
    /// List enrolled users
    List,
    /// Rename an enrolled user
    Rename { old: String, new: String },
    /// Remove an enrolled user and all of their embeddings
    Remove { name: String },
}

async fn proxy(session: bool) -> Result<DoorbellProxy<'static>> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    DoorbellProxy::new(&connection)
        .await
        .context("doorbelld is not reachable")
}

fn store_path(store: Option<PathBuf>) -> PathBuf {
    store
        .or_else(|| std::env::var_os("DOORBELL_FACE_STORE").map(PathBuf::from))
        .unwrap_or_else(doorbell_core::default_store_path)
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(text).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn run_faces(store: Option<PathBuf>, command: FacesCommand) -> Result<()> {
    let path = store_path(store);
    let mut doc = StoreDocument::read(&path)?;

    match command {
        FacesCommand::List => {
            if doc.faces.is_empty() {
                println!("No faces enrolled in {}", path.display());
            }
            for identity in &doc.faces {
                println!("{}\t{} embedding(s)", identity.name, identity.embeddings.len());
            }
            return Ok(());
        }
        FacesCommand::Rename { old, new } => {
            doc.rename_user(&old, &new)?;
            doc.write(&path)?;
            println!("Renamed {old} to {new}");
        }
        FacesCommand::Remove { name } => {
            doc.remove_user(&name)?;
            doc.write(&path)?;
            println!("Removed {name}");
        }
    }
    println!("The daemon picks up the change automatically; `doorbell reload` forces it.");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Unlock => {
            if proxy(cli.session).await?.force_unlock().await? {
                println!("Door unlocked");
            } else {
                println!("Not unlocked: the bell is not ringing");
            }
        }
        Commands::Silence => {
            if proxy(cli.session).await?.silence_bell().await? {
                println!("Bell silenced");
            } else {
                println!("The bell was not ringing");
            }
        }
        Commands::Reset => {
            proxy(cli.session).await?.reset().await?;
            println!("Door locked and bell silenced");
        }
        Commands::Reload => {
            let count = proxy(cli.session).await?.reload_faces().await?;
            println!("Loaded {count} known embedding(s)");
        }
        Commands::Status => {
            let status = proxy(cli.session).await?.status().await?;
            print_json(&status)?;
        }
        Commands::History => {
            let history = proxy(cli.session).await?.history().await?;
            let events: Vec<serde_json::Value> =
                serde_json::from_str(&history).context("daemon returned malformed JSON")?;
            if events.is_empty() {
                println!("No access events recorded");
            }
            for event in events {
                let field = |key: &str| event.get(key).and_then(|v| v.as_str()).unwrap_or("");
                let name = field("name");
                println!(
                    "{}  {:<20} {:<12} {}",
                    field("at"),
                    field("kind"),
                    field("actor"),
                    name
                );
            }
        }
        Commands::Faces { store, command } => run_faces(store, command)?,
    }

    Ok(())
}
