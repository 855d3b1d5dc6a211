use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "io.rollcall.Rollcall1",
    default_service = "io.rollcall.Rollcall1",
    default_path = "/io/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn register(&self, name: &str, group: &str, image: &[u8]) -> zbus::Result<String>;
    async fn register_from_document(&self, file_name: &str, contents: &[u8]) -> zbus::Result<String>;
    async fn recognize(&self, image: &[u8]) -> zbus::Result<String>;
    async fn mark_attendance(
        &self,
        name: &str,
        group: &str,
        image: &[u8],
        attended: bool,
        date: &str,
    ) -> zbus::Result<String>;
    async fn list_groups(&self) -> zbus::Result<String>;
    async fn list_identities(&self, group: &str) -> zbus::Result<String>;
    async fn attendance_log(&self, name: &str, limit: u32) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a face from an image
    Register {
        #[arg(short, long)]
        name: String,
        /// Group (class, team); defaults to default_group
        #[arg(short, long, default_value = "")]
        group: String,
        image: PathBuf,
    },
    /// Register from a PDF named <name>-<group>.pdf
    RegisterPdf {
        pdf: PathBuf,
        /// File name to derive the identity from, if not the path's own
        #[arg(long = "as")]
        file_name: Option<String>,
    },
    /// Identify the dominant face in an image
    Recognize { image: PathBuf },
    /// Mark attendance for a registered identity
    Mark {
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "")]
        group: String,
        image: PathBuf,
        /// Record an absence instead of a presence
        #[arg(long)]
        absent: bool,
        /// ISO 8601 date echoed in the reply (defaults to now)
        #[arg(long, default_value = "")]
        date: String,
    },
    /// List groups
    Groups,
    /// List registered identities
    Identities {
        #[arg(short, long, default_value = "")]
        group: String,
    },
    /// Show recent attendance events
    Log {
        #[arg(short, long, default_value = "")]
        name: String,
        #[arg(short, long, default_value_t = 50)]
        limit: u32,
    },
    /// Show daemon status
    Status,
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_reply(reply: &str) {
    match serde_json::from_str::<serde_json::Value>(reply) {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{reply}"),
        },
        Err(_) => println!("{reply}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable")?;

    let reply = match cli.command {
        Commands::Register { name, group, image } => {
            proxy.register(&name, &group, &read(&image)?).await?
        }
        Commands::RegisterPdf { pdf, file_name } => {
            let file_name = match file_name {
                Some(name) => name,
                None => pdf
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("{} has no file name", pdf.display()))?,
            };
            tracing::debug!(file_name = %file_name, "uploading document");
            proxy.register_from_document(&file_name, &read(&pdf)?).await?
        }
        Commands::Recognize { image } => proxy.recognize(&read(&image)?).await?,
        Commands::Mark {
            name,
            group,
            image,
            absent,
            date,
        } => {
            proxy
                .mark_attendance(&name, &group, &read(&image)?, !absent, &date)
                .await?
        }
        Commands::Groups => proxy.list_groups().await?,
        Commands::Identities { group } => proxy.list_identities(&group).await?,
        Commands::Log { name, limit } => proxy.attendance_log(&name, limit).await?,
        Commands::Status => proxy.status().await?,
    };

    print_reply(&reply);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_mark() {
        let cli = Cli::try_parse_from([
            "rollcall", "mark", "-n", "alice", "-g", "cs101", "face.jpg", "--absent",
        ])
        .unwrap();
        match cli.command {
            Commands::Mark {
                name,
                group,
                absent,
                date,
                ..
            } => {
                assert_eq!(name, "alice");
                assert_eq!(group, "cs101");
                assert!(absent);
                assert!(date.is_empty());
            }
            _ => panic!("expected mark"),
        }
    }

    #[test]
    fn test_cli_parses_register_pdf_override() {
        let cli = Cli::try_parse_from([
            "rollcall", "--system", "register-pdf", "/tmp/upload.pdf", "--as", "bob-math.pdf",
        ])
        .unwrap();
        assert!(cli.system);
        match cli.command {
            Commands::RegisterPdf { file_name, .. } => {
                assert_eq!(file_name.as_deref(), Some("bob-math.pdf"));
            }
            _ => panic!("expected register-pdf"),
        }
    }
}
