//! `agir` command line: install scenarios, run episodes, and query learner memories.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use agir_core::{Engine, EngineConfig, ScenarioDefinition};
use agir_schema::{EpisodeStatus, UserKind};
use agir_store::MemoryOrder;

#[derive(Parser)]
#[command(name = "agir", version, about = "multi-agent scenario simulation engine")]
struct Cli {
    #[arg(long, default_value = "agir.yaml", help = "Engine config file (defaults apply if missing)")]
    config: PathBuf,

    #[arg(long, help = "SQLite database path, overrides the config")]
    db: Option<PathBuf>,

    #[arg(long, help = "Also write daily rolling logs to this directory")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum MemorySort {
    Importance,
    Recency,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Parse and validate a scenario file")]
    Validate {
        #[arg(help = "Scenario YAML file")]
        file: PathBuf,
    },
    #[command(about = "Install a scenario file into the database")]
    Install {
        #[arg(help = "Scenario YAML file")]
        file: PathBuf,
    },
    #[command(about = "Run episodes of an installed scenario")]
    Run {
        #[arg(help = "Scenario name")]
        scenario: String,
        #[arg(long, help = "Learner username (defaults to the only learner)")]
        learner: Option<String>,
        #[arg(long, default_value = "1")]
        episodes: usize,
        #[arg(long, default_value = "1", help = "Episodes in flight at once")]
        concurrency: usize,
    },
    #[command(about = "Memory-augmented completion in a user's voice")]
    Complete {
        username: String,
        prompt: String,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    #[command(about = "List a user's memories")]
    Memories {
        username: String,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, value_enum, default_value = "importance")]
        by: MemorySort,
    },
    #[command(about = "Store a memory for a user")]
    Remember {
        username: String,
        text: String,
        #[arg(long, help = "Source document name")]
        document: Option<String>,
        #[arg(long, default_value = "0.5")]
        importance: f64,
    },
    #[command(about = "Read a text file into a user's memories")]
    Ingest {
        username: String,
        #[arg(help = "Plain text document")]
        file: PathBuf,
    },
    #[command(about = "Show per-role assignment counts for a scenario")]
    Assignments {
        #[arg(help = "Scenario name")]
        scenario: String,
    },
    #[command(about = "Print persisted embedding cache statistics")]
    Cache,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref())?;

    let Some(command) = cli.command else {
        println!("nothing to do; see `agir --help`");
        return Ok(());
    };

    if let Commands::Validate { file } = &command {
        let definition = ScenarioDefinition::from_path(file)?;
        definition.validate()?;
        println!(
            "{}: ok ({} roles, {} states, {} transitions)",
            definition.name,
            definition.roles.len(),
            definition.states.len(),
            definition.transitions.len()
        );
        return Ok(());
    }

    let mut config = EngineConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    let engine = Engine::from_config(config).await?;

    let shutdown = engine.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping after the current step");
            shutdown.cancel();
        }
    });

    match command {
        Commands::Validate { .. } => {}
        Commands::Install { file } => {
            let definition = ScenarioDefinition::from_path(&file)?;
            let installed = engine.install_scenario(&definition).await?;
            println!("installed scenario {} ({})", installed.scenario.name, installed.scenario.id);
            if let Some(learner) = installed.learner {
                println!("learner: {} ({})", learner.username, learner.model);
            }
        }
        Commands::Run {
            scenario,
            learner,
            episodes,
            concurrency,
        } => {
            let scenario = engine.scenario_by_name(&scenario).await?;
            let learner = match learner {
                Some(name) => engine.user_by_name(&name).await?,
                None => only_learner(&engine).await?,
            };
            let results = engine
                .run_episodes(scenario.id, learner.id, episodes, concurrency)
                .await;

            let mut failed = 0;
            for result in results {
                match result {
                    Ok(result) => {
                        if result.status != EpisodeStatus::Completed {
                            failed += 1;
                        }
                        let mut line = format!(
                            "{} {:?} steps={} memories={} fallbacks={}",
                            result.episode_id,
                            result.status,
                            result.steps,
                            result.memories.len(),
                            result.fallbacks()
                        );
                        if let Some(err) = &result.error {
                            line.push_str(&format!(" error=\"{err}\""));
                        }
                        if let Some(err) = &result.synthesis_error {
                            line.push_str(&format!(" synthesis_error=\"{err}\""));
                        }
                        println!("{line}");
                    }
                    Err(err) => {
                        failed += 1;
                        println!("episode not started: {err}");
                    }
                }
            }
            if failed > 0 {
                return Err(anyhow!("{failed} of {episodes} episodes did not complete"));
            }
        }
        Commands::Complete {
            username,
            prompt,
            temperature,
            max_tokens,
        } => {
            let user = engine.user_by_name(&username).await?;
            let completion = engine
                .complete(&prompt, user.id, temperature, max_tokens)
                .await?;
            println!("{}", serde_json::to_string_pretty(&completion)?);
        }
        Commands::Memories {
            username,
            limit,
            by,
        } => {
            let user = engine.user_by_name(&username).await?;
            let order = match by {
                MemorySort::Importance => MemoryOrder::Importance,
                MemorySort::Recency => MemoryOrder::Recency,
            };
            let memories = engine.user_memories(user.id, order, Some(limit)).await?;
            if memories.is_empty() {
                println!("no memories for {username}");
            }
            for memory in memories {
                println!(
                    "[{:.2}] ({}) {} {}",
                    memory.importance,
                    memory.source,
                    memory.created_at.format("%Y-%m-%d %H:%M"),
                    memory.content
                );
            }
        }
        Commands::Remember {
            username,
            text,
            document,
            importance,
        } => {
            let user = engine.user_by_name(&username).await?;
            let memory = engine
                .add_memory(user.id, &text, importance, document.as_deref())
                .await?;
            println!("stored memory {} for {}", memory.id, user.username);
        }
        Commands::Ingest { username, file } => {
            let user = engine.user_by_name(&username).await?;
            let memories = engine.ingest_document(user.id, &file).await?;
            println!(
                "stored {} memories for {} from {}",
                memories.len(),
                user.username,
                file.display()
            );
        }
        Commands::Assignments { scenario } => {
            let scenario = engine.scenario_by_name(&scenario).await?;
            let report = engine.assignment_report(scenario.id).await?;
            println!("scenario: {} (threshold {})", report.scenario, report.threshold);
            for row in &report.rows {
                println!("  {:<20} {:<24} {}", row.role, row.username, row.count);
            }
            if report.mismatches.is_empty() {
                println!("counters consistent with stored assignments");
            } else {
                for m in &report.mismatches {
                    println!(
                        "  mismatch role={} user={} tracked={} stored={}",
                        m.role_id, m.user_id, m.tracked, m.persisted
                    );
                }
                return Err(anyhow!("{} assignment count mismatches", report.mismatches.len()));
            }
        }
        Commands::Cache => {
            let stats = engine.embedding_cache_stats().await?;
            if stats.is_empty() {
                println!("embedding cache is empty");
            }
            for stat in stats {
                println!(
                    "{:<48} {:>8} entries  last written {}",
                    stat.namespace,
                    stat.entries,
                    stat.last_written.as_deref().unwrap_or("-")
                );
            }
        }
    }

    Ok(())
}

async fn only_learner(engine: &Engine) -> Result<agir_schema::User> {
    let mut learners = engine.store().list_users(Some(UserKind::Learner)).await?;
    match learners.len() {
        1 => Ok(learners.remove(0)),
        0 => Err(anyhow!("no learner installed; pass --learner")),
        n => Err(anyhow!("{n} learners installed; pass --learner")),
    }
}

fn init_tracing(log_dir: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "agir.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::parse_from([
            "agir",
            "--db",
            "x.db",
            "run",
            "therapy",
            "--episodes",
            "4",
            "--concurrency",
            "2",
        ]);
        assert_eq!(cli.db.as_deref(), Some(Path::new("x.db")));
        match cli.command {
            Some(Commands::Run {
                scenario,
                learner,
                episodes,
                concurrency,
            }) => {
                assert_eq!(scenario, "therapy");
                assert!(learner.is_none());
                assert_eq!((episodes, concurrency), (4, 2));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn ingest_takes_user_and_file() {
        let cli = Cli::parse_from(["agir", "ingest", "sam", "notes/triage.txt"]);
        match cli.command {
            Some(Commands::Ingest { username, file }) => {
                assert_eq!(username, "sam");
                assert_eq!(file, PathBuf::from("notes/triage.txt"));
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn memories_sort_parses() {
        let cli = Cli::parse_from(["agir", "memories", "sam", "--by", "recency", "--limit", "5"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Memories {
                by: MemorySort::Recency,
                limit: 5,
                ..
            })
        ));
    }
}
