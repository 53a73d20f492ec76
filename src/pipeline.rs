//! `mart run`: the fixed end-to-end sequence.
//!
//! ```text
//! init → [scrape] → load messages → [download] → enrich → build → [transform] → check
//! ```
//!
//! Bracketed steps are external commands from `[pipeline]` and are skipped
//! when not configured; enrichment is skipped while the detector is
//! `disabled`. Steps run one after another and the first failure stops the
//! run. The per-step outcomes are saved as a batch report either way.

use anyhow::{bail, Context, Result};
use std::fmt;

use crate::config::Config;
use crate::report::{BatchReport, UnitOutcome};
use crate::{enrich, loader, marts, migrate};

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStep {
    Init,
    External { name: &'static str, argv: Vec<String> },
    LoadMessages,
    Enrich,
    Build,
    Check,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineStep::Init => write!(f, "init"),
            PipelineStep::External { name, .. } => write!(f, "{}", name),
            PipelineStep::LoadMessages => write!(f, "load-messages"),
            PipelineStep::Enrich => write!(f, "enrich"),
            PipelineStep::Build => write!(f, "build"),
            PipelineStep::Check => write!(f, "check"),
        }
    }
}

/// The steps `mart run` will execute for this configuration, in order.
pub fn plan(config: &Config) -> Vec<PipelineStep> {
    let external = |name: &'static str, argv: &[String]| {
        (!argv.is_empty()).then(|| PipelineStep::External {
            name,
            argv: argv.to_vec(),
        })
    };

    let mut steps = vec![PipelineStep::Init];
    steps.extend(external("scrape", &config.pipeline.scrape_command));
    steps.push(PipelineStep::LoadMessages);
    steps.extend(external("download", &config.pipeline.download_command));
    if config.enrichment.is_enabled() {
        steps.push(PipelineStep::Enrich);
    }
    steps.push(PipelineStep::Build);
    steps.extend(external("transform", &config.pipeline.transform_command));
    steps.push(PipelineStep::Check);
    steps
}

pub async fn run_pipeline(config: &Config) -> Result<()> {
    let run_id = uuid::Uuid::new_v4().to_string();
    let mut report = BatchReport::new("run", &run_id);
    let steps = plan(config);

    tracing::info!(%run_id, steps = steps.len(), "pipeline started");

    let mut failure = None;
    for step in &steps {
        println!("==> {}", step);
        match run_step(config, step).await {
            Ok(()) => report.record(UnitOutcome::succeeded(step.to_string(), 0)),
            Err(e) => {
                report.record(UnitOutcome::failed(step.to_string(), format!("{:#}", e)));
                failure = Some((step.to_string(), e));
                break;
            }
        }
    }
    report.finish();

    let saved = report.save(&config.paths.reports_dir)?;
    report.print_summary();
    println!("  report: {}", saved.display());

    if let Some((step, err)) = failure {
        return Err(err.context(format!("pipeline stopped at step '{}'", step)));
    }
    println!("ok");
    Ok(())
}

async fn run_step(config: &Config, step: &PipelineStep) -> Result<()> {
    match step {
        PipelineStep::Init => migrate::run_migrations(config).await,
        PipelineStep::External { name, argv } => run_command(name, argv).await,
        PipelineStep::LoadMessages => loader::run_load_messages(config, None).await,
        PipelineStep::Enrich => enrich::run_enrich(config, None).await,
        PipelineStep::Build => marts::run_build(config).await,
        PipelineStep::Check => marts::run_check(config).await,
    }
}

/// Runs an external command with inherited stdio; a non-zero exit is an error.
async fn run_command(name: &str, argv: &[String]) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        bail!("{} command is empty", name);
    };

    tracing::info!(step = name, %program, "running external command");
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("Failed to start {} command: {}", name, program))?;

    if !status.success() {
        bail!("{} command exited with {}", name, status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DbConfig, EnrichmentConfig, PathsConfig, PipelineConfig, QueryConfig, ServerConfig,
    };
    use std::path::Path;

    fn test_config(root: &Path, pipeline: PipelineConfig) -> Config {
        Config {
            db: DbConfig {
                path: root.join("mart.sqlite"),
            },
            server: ServerConfig {
                bind: "127.0.0.1:0".into(),
            },
            paths: PathsConfig {
                messages: root.join("messages.csv"),
                image_root: root.join("images"),
                predictions_dir: root.join("predictions"),
                reports_dir: root.join("reports"),
            },
            enrichment: EnrichmentConfig::default(),
            query: QueryConfig::default(),
            pipeline,
        }
    }

    fn write_messages(root: &Path) {
        std::fs::write(
            root.join("messages.csv"),
            "message_id,channel_name,date,text,views,forwards,media_type\n\
             1,demoChan,2024-01-01 08:00:00+00:00,hello there,10,0,\n\
             2,demoChan,2024-01-02 08:00:00+00:00,second message,5,1,\n",
        )
        .unwrap();
    }

    #[test]
    fn plan_skips_unconfigured_steps() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = test_config(tmp.path(), PipelineConfig::default());
        assert_eq!(
            plan(&config),
            vec![
                PipelineStep::Init,
                PipelineStep::LoadMessages,
                PipelineStep::Build,
                PipelineStep::Check,
            ]
        );

        let mut config = test_config(
            tmp.path(),
            PipelineConfig {
                scrape_command: vec!["scrape".into()],
                download_command: vec![],
                transform_command: vec!["dbt".into(), "run".into()],
            },
        );
        config.enrichment.detector = "predictions".into();
        let names: Vec<String> = plan(&config).iter().map(|s| s.to_string()).collect();
        assert_eq!(
            names,
            ["init", "scrape", "load-messages", "enrich", "build", "transform", "check"]
        );
    }

    #[tokio::test]
    async fn runs_builtin_steps_end_to_end() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_messages(tmp.path());
        let config = test_config(tmp.path(), PipelineConfig::default());

        run_pipeline(&config).await.unwrap();

        let pool = crate::db::connect(&config).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fct_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;
        assert_eq!(n, 2);
        assert_eq!(std::fs::read_dir(tmp.path().join("reports")).unwrap().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_stops_the_run() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_messages(tmp.path());
        let config = test_config(
            tmp.path(),
            PipelineConfig {
                scrape_command: vec!["sh".into(), "-c".into(), "exit 3".into()],
                ..PipelineConfig::default()
            },
        );

        let err = run_pipeline(&config).await.unwrap_err();
        assert!(format!("{:#}", err).contains("scrape"));

        // Nothing after the failed step ran
        let pool = crate::db::connect(&config).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM raw_messages")
            .fetch_one(&pool)
            .await
            .unwrap();
        pool.close().await;
        assert_eq!(n, 0);
    }
}
