use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::{EuclideanMatcher, FaceEmbedding, Matcher, PoseTag, DEFAULT_MATCH_THRESHOLD};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.faceid.FaceId1",
    default_service = "org.faceid.FaceId1",
    default_path = "/org/faceid/FaceId1"
)]
trait FaceId {
    async fn enroll(&self, identity: &str) -> zbus::Result<String>;
    async fn verify(&self) -> zbus::Result<bool>;
    async fn cancel(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceid", about = "Face enrollment and login CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run guided capture and enroll the result
    Enroll {
        /// Identity to enroll the face under
        #[arg(short, long)]
        identity: String,
    },
    /// Capture your face and attempt a login
    Verify,
    /// Cancel the capture in progress
    Cancel,
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
    /// Compare two embedding files (JSON arrays of floats)
    Match {
        a: PathBuf,
        b: PathBuf,
        #[arg(short, long, default_value_t = DEFAULT_MATCH_THRESHOLD)]
        threshold: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { identity } => {
            let proxy = connect(cli.session).await?;
            println!("Enrolling face for {identity}. Follow the prompts.");
            let summary = with_progress(&proxy, proxy.enroll(&identity)).await?;
            let summary: serde_json::Value = serde_json::from_str(&summary)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Verify => {
            let proxy = connect(cli.session).await?;
            println!("Look at the camera...");
            if with_progress(&proxy, proxy.verify()).await? {
                println!("Login accepted");
            } else {
                println!("Login rejected");
                std::process::exit(1);
            }
        }
        Commands::Cancel => {
            let proxy = connect(cli.session).await?;
            if proxy.cancel().await? {
                println!("Capture cancelled");
            } else {
                println!("No capture in progress");
            }
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Devices => {
            let devices = faceid_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Match { a, b, threshold } => {
            let left = load_embedding(&a)?;
            let right = load_embedding(&b)?;
            let matcher = EuclideanMatcher { threshold };
            let distance = matcher.distance(&left, &right)?;
            tracing::debug!(dimension = left.len(), distance, "compared embeddings");
            let verdict = if matcher.is_match(&left, &right)? {
                "match"
            } else {
                "no match"
            };
            println!("distance {distance:.4} (threshold {threshold}): {verdict}");
        }
    }

    Ok(())
}

async fn connect(session: bool) -> Result<FaceIdProxy<'static>> {
    let connection = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    tracing::debug!(bus = if session { "session" } else { "system" }, "connected to D-Bus");
    FaceIdProxy::new(&connection)
        .await
        .context("faceidd is not reachable")
}

/// Await `call`, printing pose prompts and progress from `Status` meanwhile.
async fn with_progress<T>(
    proxy: &FaceIdProxy<'_>,
    call: impl std::future::Future<Output = zbus::Result<T>>,
) -> Result<T> {
    tokio::pin!(call);
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut last_line = String::new();

    loop {
        tokio::select! {
            result = &mut call => return Ok(result?),
            _ = ticker.tick() => {
                let status = match proxy.status().await {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::debug!(error = %e, "status poll failed");
                        continue;
                    }
                };
                if let Some(line) = progress_line(&status) {
                    if line != last_line {
                        println!("{line}");
                        last_line = line;
                    }
                }
            }
        }
    }
}

fn progress_line(status: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(status).ok()?;
    let progress = &value["progress"];
    let pose: PoseTag = serde_json::from_value(progress["state"]["pose"].clone()).ok()?;
    let percent = progress["percent"].as_f64()?;
    Some(format!("[{percent:>3.0}%] {}", pose.instruction()))
}

fn load_embedding(path: &Path) -> Result<FaceEmbedding> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not an embedding", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_while_capturing() {
        let status = r#"{"busy":true,"progress":{"state":{"state":"capturing","pose":"left"},"percent":40.0,"attempts_done":4,"attempts_total":10,"accepted":3}}"#;
        let line = progress_line(status).unwrap();
        assert!(line.starts_with("[ 40%]"));
        assert!(line.contains(PoseTag::Left.instruction()));
    }

    #[test]
    fn test_progress_line_idle_is_silent() {
        let status = r#"{"busy":false,"progress":{"state":{"state":"idle"},"percent":0.0}}"#;
        assert!(progress_line(status).is_none());
    }

    #[test]
    fn test_load_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, "[0.6, 0.8]").unwrap();
        let emb = load_embedding(&path).unwrap();
        assert_eq!(emb.as_slice(), &[0.6, 0.8]);

        std::fs::write(&path, r#"{"not":"an embedding"}"#).unwrap();
        assert!(load_embedding(&path).is_err());
    }

    #[test]
    fn test_cli_parses_match() {
        let cli = Cli::parse_from(["faceid", "match", "a.json", "b.json", "-t", "0.4"]);
        match cli.command {
            Commands::Match { threshold, .. } => assert_eq!(threshold, 0.4),
            _ => panic!("expected match command"),
        }
    }
}
