use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clo_core::{EmailOutcome, NewTemplate, StaticIdentity};
use clo_pipeline::{pipeline_from_config, Compose, OutreachPipeline, PipelineConfig};
use clo_storage::PgLeadStore;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "clo-cli")]
#[command(about = "Creator lead outreach command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze channel URLs or free text and store the leads found.
    Analyze {
        /// Text to analyze; read from --file or stdin when omitted.
        text: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// List leads, newest first.
    Leads,
    /// Re-analyze the given leads and fill in missing details.
    Enrich { ids: Vec<Uuid> },
    /// Move the given leads to the campaign stage.
    Campaign { ids: Vec<Uuid> },
    Delete { id: Uuid },
    /// Email the given leads, or every lead still `new` when no ids are given.
    Dispatch {
        ids: Vec<Uuid>,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
    },
    Send {
        id: Uuid,
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        body: Option<String>,
    },
    /// Show the email log, optionally for one lead.
    Emails {
        #[arg(long)]
        lead: Option<Uuid>,
    },
    #[command(subcommand)]
    Templates(TemplateCommands),
    Migrate,
    Serve,
}

#[derive(Debug, Subcommand)]
enum TemplateCommands {
    List,
    Create {
        #[arg(long)]
        name: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    Preview {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        lead: Option<Uuid>,
    },
}

fn read_input(text: Option<String>, file: Option<PathBuf>) -> Result<String> {
    if let Some(text) = text {
        return Ok(text);
    }
    if let Some(path) = file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()));
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("reading stdin")?;
    Ok(buf)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("clo=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();
    config.log_redacted();

    match cli.command {
        Commands::Migrate => {
            let store = PgLeadStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let pipeline = pipeline_from_config(&config).await?;
            clo_web::serve(clo_web::AppState::new(pipeline), config.web_port).await?;
        }
        command => {
            let pipeline = pipeline_from_config(&config).await?;
            let identity = StaticIdentity(config.owner_id);
            run(&pipeline, &identity, command).await?;
        }
    }

    Ok(())
}

async fn run(pipeline: &OutreachPipeline, identity: &StaticIdentity, command: Commands) -> Result<()> {
    match command {
        Commands::Analyze { text, file } => {
            let raw = read_input(text, file)?;
            let summary = pipeline.analyze_and_ingest(identity, &raw).await?;
            println!(
                "analysis complete: analyzed={} inserted={} skipped={}",
                summary.analyzed,
                summary.inserted.len(),
                summary.skipped
            );
            for lead in &summary.inserted {
                println!("{}  {} <{}>", lead.id, lead.name, lead.email);
            }
        }
        Commands::Leads => {
            for lead in pipeline.list_leads(identity).await? {
                println!(
                    "{}  {:<9}  {} <{}>  {}",
                    lead.id,
                    lead.status.as_str(),
                    lead.name,
                    lead.email,
                    lead.channel_name.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Enrich { ids } => {
            let summary = pipeline.enrich_leads(identity, &ids).await?;
            println!(
                "enrichment complete: requested={} eligible={} enriched={} failed={}",
                summary.requested, summary.eligible, summary.enriched, summary.failed
            );
        }
        Commands::Campaign { ids } => {
            let moved = pipeline.move_to_campaign(identity, &ids).await?;
            println!("moved {} lead(s) to campaign", moved.len());
        }
        Commands::Delete { id } => {
            pipeline.delete_lead(identity, id).await?;
            println!("deleted {id}");
        }
        Commands::Dispatch { ids, subject, body } => {
            let targets = pipeline.select_targets(identity, &ids).await?;
            let compose = Compose::new(subject, body);
            let result = pipeline
                .dispatch(identity, &targets, &compose, &mut |processed: usize, total: usize| {
                    eprintln!("sent {processed}/{total}");
                })
                .await?;
            println!("dispatch complete: processed={}", result.processed);
        }
        Commands::Send { id, subject, body } => {
            let compose = Compose::new(subject, body);
            pipeline.send_one(identity, id, &compose).await?;
            println!("send attempted; see `emails --lead {id}` for the outcome");
        }
        Commands::Emails { lead } => {
            for entry in pipeline.list_email_logs(identity, lead).await? {
                let detail = match &entry.outcome {
                    EmailOutcome::Sent { sent_at } => sent_at.to_rfc3339(),
                    EmailOutcome::Failed { error_message } => error_message.clone(),
                };
                println!(
                    "{}  {:<6}  lead={}  {}  {}",
                    entry.created_at.to_rfc3339(),
                    entry.outcome.as_str(),
                    entry.lead_id,
                    entry.subject,
                    detail
                );
            }
        }
        Commands::Templates(TemplateCommands::List) => {
            for template in pipeline.list_templates(identity).await? {
                println!("{}  {}  {}", template.id, template.name, template.subject);
            }
        }
        Commands::Templates(TemplateCommands::Create { name, subject, body }) => {
            let template = pipeline
                .create_template(identity, NewTemplate { name, subject, body })
                .await?;
            info!(template_id = %template.id, "template created");
            println!("created template {}", template.id);
        }
        Commands::Templates(TemplateCommands::Preview { subject, body, lead }) => {
            let preview = pipeline.preview_template(identity, &subject, &body, lead).await?;
            println!("Subject: {}\n\n{}", preview.subject, preview.body);
        }
        Commands::Migrate | Commands::Serve => {}
    }
    Ok(())
}
