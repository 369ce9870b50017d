use clap::{Parser, Subcommand};
use std::path::PathBuf;

use answer_harness::{app::App, config, crawler::CrawlRequest, projects};

#[derive(Parser)]
#[command(
    name = "ans",
    about = "Answer Harness — a multi-tenant retrieval-augmented answering platform",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/answer.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Start the HTTP server with all background workers
    Serve,

    /// Run a one-shot crawl for a project and wait for it to finish
    Crawl {
        /// Project slug
        project: String,

        /// Seed URL
        start_url: String,

        /// Link depth from the seed
        #[arg(long, default_value_t = 2)]
        max_depth: u32,

        /// Total page budget
        #[arg(long, default_value_t = 100)]
        max_pages: u32,

        /// Ignore robots.txt
        #[arg(long)]
        no_robots: bool,
    },

    /// Search a project's knowledge base from the CLI
    Search {
        /// Project slug
        project: String,

        /// Query text
        query: String,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Run one indexing pass over pending documents
    Index,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = answer_harness::db::connect(&cfg.db.path).await?;
            answer_harness::migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let app = App::init(cfg).await?;
            app.start_background().await;
            let serving = answer_harness::server::run_server(app.clone());
            tokio::select! {
                result = serving => result?,
                _ = tokio::signal::ctrl_c() => {
                    app.shutdown().await;
                }
            }
        }
        Commands::Crawl {
            project,
            start_url,
            max_depth,
            max_pages,
            no_robots,
        } => {
            let app = App::init(cfg).await?;
            let project = projects::get_project(&app.pool, &project)
                .await?
                .ok_or_else(|| anyhow::anyhow!("project not found: {}", project))?;

            let request = CrawlRequest {
                start_url,
                max_depth,
                max_pages,
                respect_robots: !no_robots,
                use_sitemap: true,
                allow_hosts: vec![],
                block_hosts: vec![],
            };
            let job_id = app.crawler.start(&project, request).await?;
            println!("crawl started: {}", job_id);

            loop {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                let Some(job) = app.crawler.status(&project.slug).await? else {
                    continue;
                };
                println!(
                    "  {}: done={} failed={} queued={}",
                    job.status.as_str(),
                    job.counters.done,
                    job.counters.failed,
                    job.counters.queued
                );
                if job.status.is_terminal() {
                    if let Some(error) = job.last_error {
                        println!("  last error: {}", error);
                    }
                    break;
                }
            }

            // Index what the crawl produced before exiting.
            app.indexer.scan_once().await?;
            println!("ok");
        }
        Commands::Search {
            project,
            query,
            limit,
        } => {
            let app = App::init(cfg).await?;
            let result = app
                .retriever
                .hybrid_search(&project, &query, limit.unwrap_or(0))
                .await?;
            if result.hits.is_empty() {
                println!("No results.");
            } else {
                if result.degraded {
                    println!("(degraded: lexical-only)");
                }
                for (i, hit) in result.hits.iter().enumerate() {
                    let title = hit.title.as_deref().unwrap_or("(untitled)");
                    println!("{}. [{:.3}] {}", i + 1, hit.score, title);
                    if let Some(ref url) = hit.source_url {
                        println!("    url: {}", url);
                    }
                    println!("    excerpt: \"{}\"", hit.excerpt.replace('\n', " "));
                    println!();
                }
            }
        }
        Commands::Index => {
            let app = App::init(cfg).await?;
            app.indexer.scan_once().await?;
            println!("ok");
        }
    }

    Ok(())
}
