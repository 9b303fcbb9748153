use std::str::FromStr;
use std::sync::Arc;

use cron::Schedule;
use mail_triage::batch::{BatchOrchestrator, LocalDispatcher};
use mail_triage::calendar::{ConflictChecker, GoogleFreeBusy};
use mail_triage::classify::anthropic::AnthropicClassifier;
use mail_triage::config::{AppConfig, ClassifierConfig};
use mail_triage::mail::{GmailClient, MailProvider};
use mail_triage::pipeline::ClassificationWorkflow;
use mail_triage::review::ReviewQueue;
use mail_triage::server::{api_routes, ApiState};
use mail_triage::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing; optionally mirror to a rolling log file
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("TRIAGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = AppConfig::from_env()?;
    let classifier_config = ClassifierConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });

    let gmail_token = std::env::var("GMAIL_ACCESS_TOKEN").unwrap_or_else(|_| {
        eprintln!("Error: GMAIL_ACCESS_TOKEN not set");
        std::process::exit(1);
    });

    let port: u16 = std::env::var("TRIAGE_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("📬 Mail Triage v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{port}");

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("TRIAGE_DB_PATH").unwrap_or_else(|_| "./data/mail-triage.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Providers ────────────────────────────────────────────────────────
    let mail: Arc<dyn MailProvider> =
        Arc::new(GmailClient::new(secrecy::SecretString::from(gmail_token)));
    let classifier = Arc::new(AnthropicClassifier::new(classifier_config));

    let calendar: Option<Arc<dyn ConflictChecker>> = match std::env::var("GOOGLE_CALENDAR_TOKEN") {
        Ok(token) => {
            eprintln!("   Calendar: enabled");
            Some(Arc::new(GoogleFreeBusy::new(secrecy::SecretString::from(
                token,
            ))))
        }
        Err(_) => {
            eprintln!("   Calendar: disabled (GOOGLE_CALENDAR_TOKEN not set)");
            None
        }
    };

    // ── Pipeline + batch ─────────────────────────────────────────────────
    let workflow = Arc::new(ClassificationWorkflow::new(
        Arc::clone(&db),
        Arc::clone(&mail),
        classifier,
        calendar,
        config.clone(),
    ));

    let (dispatcher, mut worker_rx) = LocalDispatcher::channel(64);
    let orchestrator = Arc::new(BatchOrchestrator::new(
        Arc::clone(&db),
        Arc::clone(&mail),
        Arc::clone(&workflow),
        Arc::new(dispatcher),
        config.clone(),
    ));

    // Worker loop: drains dispatched chunk invocations
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            while let Some(job_id) = worker_rx.recv().await {
                if let Err(e) = orchestrator.advance(&job_id).await {
                    tracing::error!(%job_id, error = %e, "Chunk invocation failed");
                }
            }
        });
    }

    // ── Periodic unread scan ─────────────────────────────────────────────
    let scan_cron =
        std::env::var("TRIAGE_SCAN_CRON").unwrap_or_else(|_| "0 */5 * * * *".to_string());
    match Schedule::from_str(&scan_cron) {
        Ok(schedule) => {
            eprintln!("   Scan: {scan_cron}");
            let mail = Arc::clone(&mail);
            let workflow = Arc::clone(&workflow);
            let page_size = config.page_size;
            tokio::spawn(async move {
                loop {
                    let Some(next) = schedule.upcoming(chrono::Utc).next() else {
                        break;
                    };
                    let wait = (next - chrono::Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;

                    match mail.list_messages("is:unread", page_size).await {
                        Ok(refs) => {
                            tracing::info!(count = refs.len(), "Unread scan");
                            for msg_ref in refs {
                                if let Err(e) = workflow.process_message(&msg_ref).await {
                                    tracing::warn!(id = %msg_ref.id, error = %e, "Scan item failed");
                                }
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Unread scan listing failed"),
                    }
                }
            });
        }
        Err(e) => eprintln!("   Scan: disabled (bad TRIAGE_SCAN_CRON: {e})"),
    }

    // ── API server ───────────────────────────────────────────────────────
    let reviews = Arc::new(ReviewQueue::new(Arc::clone(&db), Arc::clone(&workflow)));
    let app = api_routes(ApiState {
        db,
        orchestrator,
        reviews,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
