use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceattend_client::{
    ApiError, Attendance, AttendanceApi, AttendanceError, AttemptOutcome, Config, CredentialStore,
    DetectionChannel, ExtractorProcess, FileCapture, FileCredentialStore, HttpApi, Readiness,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "faceattend", about = "Face recognition attendance client")]
struct Cli {
    /// Attendance server URL (overrides FACEATTEND_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to the attendance server
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
    },
    /// Forget the stored login
    Logout,
    /// List enrolled employees
    Roster,
    /// Mark attendance from a photo
    Mark {
        /// Photo of the employee's face
        #[arg(long)]
        photo: PathBuf,
        /// Confirm without prompting
        #[arg(short, long)]
        yes: bool,
        /// Match threshold (overrides FACEATTEND_MATCH_THRESHOLD)
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Show configuration and login state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let credentials: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(&config.credentials_path));
    let api = Arc::new(
        HttpApi::new(&config.server_url, config.request_timeout(), credentials.clone())
            .context("failed to build HTTP client")?,
    );

    match cli.command {
        Commands::Login { username, password } => {
            let creds = api.login(&username, &password).await?;
            let name = if creds.user.name.is_empty() {
                &username
            } else {
                &creds.user.name
            };
            println!("Logged in as {name}");
        }
        Commands::Logout => {
            api.logout()?;
            println!("Logged out");
        }
        Commands::Roster => {
            let roster = api.fetch_roster().await.map_err(|e| match e {
                ApiError::SessionExpired => session_expired(),
                other => anyhow::Error::new(other).context("failed to load employees"),
            })?;
            if roster.is_empty() {
                println!("No employees enrolled");
            }
            for identity in roster.iter() {
                println!(
                    "{:>6}  {:<30}  {} sample(s)",
                    identity.id.to_string(),
                    identity.name,
                    identity.embeddings.len()
                );
            }
        }
        Commands::Mark {
            photo,
            yes,
            threshold,
        } => {
            if let Some(threshold) = threshold {
                config.match_threshold = threshold;
            }
            mark(&config, api, photo, yes).await?;
        }
        Commands::Status => {
            println!("server:      {}", config.server_url);
            println!("threshold:   {}", config.match_threshold);
            println!("extractor:   {}", config.extractor_cmd);
            match credentials.get()? {
                Some(creds) => println!(
                    "login:       {} (since {})",
                    creds.user.username,
                    creds.issued_at.format("%Y-%m-%d %H:%M UTC")
                ),
                None => println!("login:       not logged in"),
            }
        }
    }

    Ok(())
}

async fn mark(config: &Config, api: Arc<HttpApi>, photo: PathBuf, yes: bool) -> Result<()> {
    let (program, args) = config
        .extractor_command()
        .context("FACEATTEND_EXTRACTOR_CMD is empty")?;
    let transport = ExtractorProcess::spawn(&program, &args)
        .with_context(|| format!("failed to start extractor {program}"))?;
    let channel = DetectionChannel::spawn(transport);

    let mut status = channel.subscribe_status();
    let progress = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            if let Some(message) = status.borrow_and_update().clone() {
                println!("{message}");
            }
        }
    });

    let attendance = Attendance::new(
        channel,
        api,
        Arc::new(FileCapture::new(photo, config.jpeg_quality)),
        config.match_threshold,
        config.request_timeout(),
    );

    println!("Loading face models...");
    let ready = attendance.wait_ready(config.ready_timeout()).await;
    progress.abort();
    if let Err(e) = ready {
        if attendance.readiness() == Readiness::Loading {
            bail!("face models did not load within {}s", config.ready_timeout_secs);
        }
        return Err(friendly(e));
    }

    attendance.reload_roster().await.map_err(friendly)?;

    let result = match attendance.capture_and_detect().await.map_err(friendly)? {
        AttemptOutcome::Matched(result) => result,
        AttemptOutcome::Rejected(rejection) => bail!("{}", rejection.user_message()),
        AttemptOutcome::Superseded => bail!("attempt was cancelled"),
    };

    println!(
        "Recognized {} (confidence {:.1}%)",
        result.identity.name,
        result.confidence_percent()
    );

    if !yes && !prompt(&format!("Mark attendance for {}? [y/N] ", result.identity.name)).await? {
        attendance.reset().await;
        println!("Cancelled");
        return Ok(());
    }

    let confirmation = attendance.confirm().await.map_err(friendly)?;
    println!(
        "Attendance marked for {} on {} at {}",
        confirmation.name, confirmation.date, confirmation.time
    );
    Ok(())
}

async fn prompt(question: &str) -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(question.as_bytes()).await?;
    stdout.flush().await?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn session_expired() -> anyhow::Error {
    anyhow::anyhow!("session expired, run `faceattend login` again")
}

fn friendly(e: AttendanceError) -> anyhow::Error {
    if e.needs_login() {
        session_expired()
    } else {
        e.into()
    }
}
