// Workflow CLI
//
// Design Decision: Use clap derive for argument parsing, same flags as the env config.
// Design Decision: Verification runs fully offline; trigger and cancel talk to the queue API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use qstash_workflow::{TriggerRequest, VerifyRequest, WorkflowClient, WorkflowConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "qstash-workflow")]
#[command(about = "Verify queue signatures and start or cancel workflow runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an `Upstash-Signature` token against a request body
    Verify {
        /// The signature token
        #[arg(long, short)]
        signature: String,

        /// File holding the exact request body
        #[arg(long)]
        body_file: PathBuf,

        /// Url the message must have been signed for
        #[arg(long)]
        url: Option<String>,

        /// Region the request came from (e.g. eu-central-1)
        #[arg(long)]
        region: Option<String>,

        /// Seconds of clock skew to tolerate
        #[arg(long, default_value = "0")]
        clock_tolerance: u64,
    },

    /// Start a workflow run
    Trigger {
        /// Workflow endpoint url
        url: String,

        /// Initial payload
        #[arg(long, default_value = "")]
        body: String,

        /// Header forwarded to the route, as `name:value`
        #[arg(long = "header", short = 'H')]
        headers: Vec<String>,

        #[arg(long)]
        run_id: Option<String>,
    },

    /// Cancel a workflow run
    Cancel {
        run_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "qstash_workflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = WorkflowConfig::from_env()?;

    match cli.command {
        Commands::Verify {
            signature,
            body_file,
            url,
            region,
            clock_tolerance,
        } => {
            let Some(receiver) = config.receiver() else {
                bail!("no signing keys configured, set QSTASH_CURRENT_SIGNING_KEY and QSTASH_NEXT_SIGNING_KEY");
            };
            let body = std::fs::read(&body_file)
                .with_context(|| format!("reading {}", body_file.display()))?;

            let mut request = VerifyRequest::new(&signature, &body)
                .with_clock_tolerance(clock_tolerance)
                .with_region(region.as_deref());
            if let Some(url) = url.as_deref() {
                request = request.with_url(url);
            }

            let claims = receiver.verify(&request)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
        Commands::Trigger {
            url,
            body,
            headers,
            run_id,
        } => {
            let client = WorkflowClient::new(Arc::new(config.publisher()?));
            let mut request = TriggerRequest::new(url, body).with_retries(config.retries);
            for header in headers {
                let Some((name, value)) = header.split_once(':') else {
                    bail!("invalid header '{header}', expected name:value");
                };
                request = request.with_header(name.trim(), value.trim());
            }
            if let Some(run_id) = run_id {
                request = request.with_run_id(run_id);
            }

            let run_id = client.trigger(request).await?;
            println!("{run_id}");
        }
        Commands::Cancel { run_id } => {
            let client = WorkflowClient::new(Arc::new(config.publisher()?));
            let outcome = client.cancel(&run_id).await?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}
