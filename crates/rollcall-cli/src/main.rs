use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

mod import;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a student from one or more portrait photos
    Register {
        /// Scope path, e.g. "CS/BS CS/Fall 2020/CS101"
        scope: String,
        /// Student identifier (roll number)
        identity: String,
        /// Portrait photos of the student
        #[arg(required = true)]
        photos: Vec<PathBuf>,
    },
    /// Register every student under a directory of `<roll number>/<photos>` folders
    Import {
        scope: String,
        /// Directory holding one folder of portrait photos per student
        dir: PathBuf,
    },
    /// Mark attendance from a group photo
    Mark {
        scope: String,
        photo: PathBuf,
    },
    /// Show attendance for a date (YYYY-MM-DD), or the full history
    Attendance {
        scope: String,
        #[arg(short, long)]
        date: Option<String>,
    },
    /// List registered students in a scope
    List {
        scope: String,
    },
    /// Show daemon status
    Status,
}

#[zbus::proxy(
    interface = "org.freedesktop.RollCall1",
    default_service = "org.freedesktop.RollCall1",
    default_path = "/org/freedesktop/RollCall1"
)]
trait RollCall {
    async fn register(&self, scope: &str, identity: &str, photos: Vec<Vec<u8>>) -> zbus::Result<u32>;
    async fn mark_attendance(&self, scope: &str, photo: Vec<u8>) -> zbus::Result<String>;
    async fn attendance(&self, scope: &str, date: &str) -> zbus::Result<String>;
    async fn list_identities(&self, scope: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollCallProxy::new(&conn).await?;

    match cli.command {
        Commands::Register { scope, identity, photos } => {
            let mut images = Vec::with_capacity(photos.len());
            for path in &photos {
                images.push(read_photo(path).await?);
            }
            let stored = proxy
                .register(&scope, &identity, images)
                .await
                .context("rollcalld Register() failed")?;
            println!("Registered {identity} in {scope} ({stored} embeddings stored)");
        }
        Commands::Import { scope, dir } => {
            import_dir(&proxy, &scope, &dir).await?;
        }
        Commands::Mark { scope, photo } => {
            let image = read_photo(&photo).await?;
            let report = proxy
                .mark_attendance(&scope, image)
                .await
                .context("rollcalld MarkAttendance() failed")?;
            print_json(&report)?;
        }
        Commands::Attendance { scope, date } => {
            let reply = proxy
                .attendance(&scope, date.as_deref().unwrap_or(""))
                .await
                .context("rollcalld Attendance() failed")?;
            print_json(&reply)?;
        }
        Commands::List { scope } => {
            let reply = proxy
                .list_identities(&scope)
                .await
                .context("rollcalld ListIdentities() failed")?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let reply = proxy.status().await.context("rollcalld not reachable")?;
            print_json(&reply)?;
        }
    }

    Ok(())
}

async fn import_dir(proxy: &RollCallProxy<'_>, scope: &str, dir: &Path) -> Result<()> {
    let entries = import::scan(dir).await?;
    if entries.is_empty() {
        anyhow::bail!("no student folders under {}", dir.display());
    }

    let mut failed = 0usize;
    for entry in &entries {
        if entry.photos.is_empty() {
            println!("{}: skipped (no photos)", entry.identity);
            failed += 1;
            continue;
        }

        let mut images = Vec::with_capacity(entry.photos.len());
        for path in &entry.photos {
            images.push(read_photo(path).await?);
        }
        match proxy.register(scope, &entry.identity, images).await {
            Ok(stored) => println!("{}: registered ({stored} embeddings)", entry.identity),
            Err(e) => {
                println!("{}: failed: {e}", entry.identity);
                failed += 1;
            }
        }
    }

    println!("{} of {} students registered in {scope}", entries.len() - failed, entries.len());
    if failed > 0 {
        anyhow::bail!("{failed} student(s) not registered");
    }
    Ok(())
}

async fn read_photo(path: &Path) -> Result<Vec<u8>> {
    tracing::debug!(path = %path.display(), "reading photo");
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
