use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use spatial_qc::config::{load_relation_rules, load_rule_matrix, load_topology_rules};
use spatial_qc::rule::Severity;
use spatial_qc::{
    GdalDrivers, IndexKind, JobController, RuleSet, RunOptions, RunOutcome, RunStatus, Stage,
    VectorDataset,
};

#[derive(Parser)]
#[command(name = "spatial-qc", version, about = "Validates vector datasets against a rule set")]
struct Cli {
    /// off, error, warn, info, debug or trace
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the validation pipeline over a store
    Validate {
        /// The vector store to validate
        store: PathBuf,

        /// Rule matrix CSV (TableId, TableName, GeometryType, rules...)
        #[arg(long)]
        rules: PathBuf,

        /// JSON file with cross-layer relation rules
        #[arg(long)]
        relation_rules: Option<PathBuf>,

        /// JSON file with topology rules
        #[arg(long)]
        topology_rules: Option<PathBuf>,

        /// Error store to create or append to
        #[arg(long, default_value = "qc_result.gpkg")]
        output: PathBuf,

        /// GDAL driver for the error store; inferred from the output
        /// extension when omitted
        #[arg(long)]
        driver: Option<String>,

        /// Stage numbers to run (1 tables, 2 schema, 3 geometry,
        /// 4 attribute relations, 5 spatial relations)
        #[arg(long, value_delimiter = ',')]
        stages: Option<Vec<u32>>,

        /// rtree, quadtree or grid
        #[arg(long, default_value = "rtree")]
        index: String,

        /// Skip the remaining stages when table checks fail
        #[arg(long)]
        stop_on_table_failure: bool,

        #[arg(long, default_value = "validation")]
        run_name: String,

        #[arg(long, env = "QC_EXECUTED_BY")]
        executed_by: Option<String>,

        /// Memory ceiling for batch sizing, in MiB
        #[arg(long)]
        memory_limit_mb: Option<u64>,

        /// Suppress the summary, keep only the exit code
        #[arg(long)]
        quiet: bool,
    },
    /// List GDAL vector drivers and their capabilities
    Drivers,
    /// List the layers of a store with counts and extents
    Layers { store: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = LevelFilter::from_str(&cli.log_level).unwrap_or(LevelFilter::Warn);
    if let Err(error) = SimpleLogger::new().with_level(level).init() {
        eprintln!("logger init failed: {error}");
    }
    match dispatch(cli) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            eprintln!("{} {error:#}", "error:".red().bold());
            let code = error
                .downcast_ref::<spatial_qc::EngineError>()
                .map(|engine| engine.exit_code())
                .unwrap_or(3);
            ExitCode::from(code as u8)
        }
    }
}

fn dispatch(cli: Cli) -> anyhow::Result<u8> {
    match cli.command {
        Commands::Validate {
            store,
            rules,
            relation_rules,
            topology_rules,
            output,
            driver,
            stages,
            index,
            stop_on_table_failure,
            run_name,
            executed_by,
            memory_limit_mb,
            quiet,
        } => {
            let tables = load_rule_matrix(&rules)?;
            let relations = relation_rules
                .as_deref()
                .map(load_relation_rules)
                .transpose()?
                .unwrap_or_default();
            let topology = topology_rules
                .as_deref()
                .map(load_topology_rules)
                .transpose()?
                .unwrap_or_default();
            let version = rules
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unversioned".to_owned());
            let ruleset = RuleSet::assemble(version, tables, relations, topology);
            // Configuration problems exit with code 2 before a run starts.
            ruleset.validate()?;

            let mut options = RunOptions::new(store, output);
            options.output_driver = driver;
            options.stop_on_table_failure = stop_on_table_failure;
            options.run_name = run_name;
            options.index_kind = IndexKind::from_str(&index)
                .map_err(|message| anyhow::anyhow!(message))?;
            if let Some(user) = executed_by {
                options.executed_by = user;
            }
            if let Some(limit) = memory_limit_mb {
                options.memory_ceiling_bytes = limit * 1024 * 1024;
            }
            if let Some(numbers) = stages {
                let mut selected = Vec::new();
                for number in numbers {
                    selected.push(Stage::from_number(number).with_context(|| {
                        format!("unknown stage number {number}, expected 1..=5")
                    })?);
                }
                options.stages = selected;
            }

            let controller = JobController::new();
            let job = controller.start_validation(options, ruleset);
            let outcome = controller
                .wait(job)
                .context("job vanished before completion")?
                .map_err(|message| anyhow::anyhow!(message))?;
            if !quiet {
                print_summary(&outcome);
            }
            Ok(exit_code(&outcome))
        }
        Commands::Drivers => {
            let drivers = GdalDrivers;
            let read_write = drivers.capability(true, true);
            let mut rows: Vec<(&String, &String)> = read_write.iter().collect();
            rows.sort();
            println!("{}", "read+write vector drivers".bold());
            for (name, extensions) in rows {
                println!("  {name:24} {extensions}");
            }
            let mut read_only: Vec<(String, String)> = drivers
                .capability(true, false)
                .into_iter()
                .filter(|(name, _)| !read_write.contains_key(name))
                .collect();
            read_only.sort();
            println!("{}", "read-only vector drivers".bold());
            for (name, extensions) in read_only {
                println!("  {name:24} {extensions}");
            }
            Ok(0)
        }
        Commands::Layers { store } => {
            let dataset = VectorDataset::open(&store)?;
            for name in dataset.layer_names() {
                let count = dataset.record_count(&name).unwrap_or(-1);
                let geometry = dataset
                    .layer_geometry_type(&name)
                    .unwrap_or_else(|_| "?".to_owned());
                match dataset.layer_extent(&name) {
                    Ok(extent) if !extent.is_empty() => println!(
                        "{name:32} {geometry:16} {count:>10}  [{:.2}, {:.2}] - [{:.2}, {:.2}]",
                        extent.min_x(),
                        extent.min_y(),
                        extent.max_x(),
                        extent.max_y()
                    ),
                    _ => println!("{name:32} {geometry:16} {count:>10}  (no extent)"),
                }
            }
            Ok(0)
        }
    }
}

fn print_summary(outcome: &RunOutcome) {
    let state = match outcome.state {
        RunStatus::Completed => "Completed".green().bold(),
        RunStatus::Cancelled => "Cancelled".yellow().bold(),
        RunStatus::Failed => "Failed".red().bold(),
        RunStatus::Running => "Running".normal(),
    };
    println!("run {} {state}", outcome.run.run_id);
    for stage in &outcome.stages {
        println!(
            "  stage {} {:24} {:?} ({} errors, {} warnings, {} ms)",
            stage.stage.number(),
            stage.stage.title(),
            stage.state,
            stage.errors,
            stage.warnings,
            stage.duration_ms
        );
        if let Some(note) = &stage.note {
            println!("    {}", note.yellow());
        }
    }
    let statistics = &outcome.statistics;
    let mut severities: Vec<(&Severity, &u64)> = statistics.by_severity.iter().collect();
    severities.sort_by_key(|(severity, _)| **severity);
    for (severity, count) in severities {
        let label = severity.storage_code();
        let line = format!("  {label:6} {count}");
        match severity {
            Severity::Critical | Severity::Error => println!("{}", line.red()),
            Severity::Warning => println!("{}", line.yellow()),
            Severity::Info => println!("{line}"),
        }
    }
    println!("{}", outcome.run.summary);
}

fn exit_code(outcome: &RunOutcome) -> u8 {
    match outcome.state {
        RunStatus::Cancelled => 4,
        RunStatus::Failed => 3,
        RunStatus::Running | RunStatus::Completed => {
            if outcome.statistics.total() > 0 {
                1
            } else {
                0
            }
        }
    }
}
