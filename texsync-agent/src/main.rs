//! Headless texsync agent.
//!
//! Joins documents of a project, mirrors them to stdout or files and
//! optionally pushes a local file as an edit. With `--follow` it keeps the
//! mirrors current until interrupted.

mod mirror;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use mirror::Target;
use texsync_collab::{CollabError, Credentials, ProjectSession, SessionConfig, SurfaceEvent};
use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

#[derive(Parser, Debug)]
#[command(name = "texsync-agent", version, about = "Mirror a collaborative LaTeX document")]
struct Args {
    /// Project id, as in `{server}/project/{id}`
    project: String,

    /// Server base URL
    #[arg(long, default_value = "https://www.overleaf.com")]
    server: String,

    /// Document to join, repeatable; defaults to the project's root document
    #[arg(long)]
    doc: Vec<String>,

    /// `Cookie` header of a logged-in browser session
    #[arg(long, env = "TEXSYNC_COOKIE", hide_env_values = true)]
    cookie: String,

    /// CSRF token from the project page
    #[arg(long, env = "TEXSYNC_CSRF", hide_env_values = true, default_value = "")]
    csrf: String,

    /// Write the document here instead of stdout; a directory when
    /// several documents are joined
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Replace the document content with this file after joining
    #[arg(long)]
    push: Option<PathBuf>,

    /// Mark pushed edits as tracked changes
    #[arg(long)]
    track_changes: bool,

    /// Keep mirroring remote changes until Ctrl-C
    #[arg(short, long)]
    follow: bool,

    /// Seconds to wait for the server to acknowledge an update
    #[arg(long, default_value_t = 15)]
    ack_timeout: u64,
}

#[derive(Error, Debug)]
enum AgentError {
    #[error(transparent)]
    Collab(#[from] CollabError),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Project has no root document; pass --doc")]
    NoRootDocument,

    #[error("Several documents need --output pointing to a directory")]
    OutputDirectoryRequired,

    #[error("--push needs exactly one document")]
    PushNeedsOneDocument,

    #[error("Document {0} was detached")]
    Detached(String),

    #[error("Push was not acknowledged within {0:?}")]
    PushUnacknowledged(Duration),
}

impl AgentError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("texsync-agent: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AgentError> {
    let config = SessionConfig {
        ack_timeout: Duration::from_secs(args.ack_timeout),
        track_changes: args.track_changes,
        ..SessionConfig::default()
    };
    let credentials = Credentials::new(&args.server, &args.cookie, &args.csrf);
    let (session, mut events) = ProjectSession::over_http(&args.project, credentials, config.clone());

    session.connect().await?;
    session.wait_until_joined().await?;
    info!(
        "Joined project {}",
        session.project_name().await.unwrap_or_else(|| args.project.clone())
    );

    let doc_ids = if args.doc.is_empty() {
        vec![session.root_doc_id().await.ok_or(AgentError::NoRootDocument)?]
    } else {
        args.doc.clone()
    };
    let mut mirrors = mirror::plan(&doc_ids, args.output.as_deref()).ok_or(AgentError::OutputDirectoryRequired)?;
    if doc_ids.len() > 1 {
        if let Some(dir) = &args.output {
            std::fs::create_dir_all(dir).map_err(|e| AgentError::io(dir, e))?;
        }
    }
    for doc_id in &doc_ids {
        session.join_document(doc_id).await?;
    }

    if let Some(path) = &args.push {
        let [doc_id] = doc_ids.as_slice() else {
            return Err(AgentError::PushNeedsOneDocument);
        };
        let lines = mirror::load_lines(path).map_err(|e| AgentError::io(path, e))?;
        push(&session, doc_id, &lines, config.ack_timeout).await?;
    }
    for (target, doc_id) in mirrors.iter() {
        write_out(&session, doc_id, target).await?;
    }

    if args.follow {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    None => break,
                    Some(SurfaceEvent::Status(text)) => info!("{text}"),
                    Some(SurfaceEvent::Write { doc_id, .. } | SurfaceEvent::ApplyOp { doc_id, .. }) => {
                        if let Some(target) = mirrors.handle_for(&doc_id) {
                            write_out(&session, &doc_id, target).await?;
                        }
                    }
                    Some(SurfaceEvent::Detached { doc_id }) => {
                        if mirrors.unregister_doc(&doc_id).is_some() {
                            warn!("{doc_id} was detached");
                            if mirrors.is_empty() {
                                return Err(AgentError::Detached(doc_id));
                            }
                        }
                    }
                    Some(_) => {}
                },
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

/// Send `lines` as a local edit and wait until the server acknowledged it.
async fn push(session: &ProjectSession, doc_id: &str, lines: &[String], ack_timeout: Duration) -> Result<(), AgentError> {
    let before = session.document_version(doc_id).await.unwrap_or_default();
    let sent = session.send_local_edit(doc_id, lines).await?;
    if sent == 0 {
        info!("{doc_id} already matches the pushed file");
        return Ok(());
    }
    info!("Pushing {sent} op(s) to {doc_id} at v{before}");

    let started = Instant::now();
    let acked = timeout(ack_timeout + Duration::from_secs(1), async {
        loop {
            match session.document_version(doc_id).await {
                Some(version) if version > before => return true,
                Some(_) => sleep(Duration::from_millis(50)).await,
                None => return false,
            }
        }
    })
    .await;

    match acked {
        Ok(true) => {
            info!("{doc_id} acknowledged after {:?}", started.elapsed());
            Ok(())
        }
        Ok(false) => Err(AgentError::Detached(doc_id.to_string())),
        Err(_) => {
            warn!("No acknowledgement for {doc_id}");
            Err(AgentError::PushUnacknowledged(ack_timeout))
        }
    }
}

async fn write_out(session: &ProjectSession, doc_id: &str, target: &Target) -> Result<(), AgentError> {
    let lines = session
        .document_lines(doc_id)
        .await
        .ok_or_else(|| CollabError::UnknownDocument(doc_id.to_string()))?;
    target.write(&lines).map_err(|e| match target.path() {
        Some(path) => AgentError::io(path, e),
        None => AgentError::io(Path::new("<stdout>"), e),
    })
}
