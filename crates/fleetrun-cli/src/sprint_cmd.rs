//! Sprint subcommands: run a feature list through the dependency executor.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fleetrun_core::{Agent, CommandAgent, Config};
use fleetrun_engine::executor::{DependencyExecutor, ExecutorError};
use fleetrun_engine::graph::{Feature, FeatureList, TaskGraph, TaskStatus};
use fleetrun_engine::pool::WorkerPool;

/// Sprint subcommand actions.
#[derive(Subcommand, Debug)]
pub enum SprintAction {
    /// Print the order features would run in
    Plan {
        /// Feature list JSON file
        feature_list: PathBuf,
    },
    /// Run every unfinished feature through the agent
    Run {
        /// Feature list JSON file
        feature_list: PathBuf,
        /// Concurrent agents (defaults to the configured pool size)
        #[arg(short = 'j', long)]
        workers: Option<usize>,
        /// Print the plan without running anything
        #[arg(long)]
        dry_run: bool,
        /// Directory the agent works in (defaults to the current directory)
        #[arg(short, long)]
        workspace: Option<PathBuf>,
    },
}

/// Execute a sprint subcommand.
pub async fn run(config: &Config, action: SprintAction) -> anyhow::Result<()> {
    let mut out = io::stdout();
    match action {
        SprintAction::Plan { feature_list } => {
            let (graph, list) = load_graph(&feature_list)?;
            write_plan(&mut out, &graph, &list)?;
        }
        SprintAction::Run {
            feature_list,
            workers,
            dry_run,
            workspace,
        } => {
            let (mut graph, list) = load_graph(&feature_list)?;
            if dry_run {
                write_plan(&mut out, &graph, &list)?;
                return Ok(());
            }
            let workspace = match workspace {
                Some(dir) => dir,
                None => std::env::current_dir()?,
            };
            let agent: Arc<dyn Agent> =
                Arc::new(CommandAgent::from_config(&config.agent).with_working_dir(workspace));
            let pool = WorkerPool::new(workers.unwrap_or(config.pool.workers));
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, letting running features finish");
                    trigger.cancel();
                }
            });

            let result = run_sprint(&mut graph, &list, &pool, agent, cancel).await;
            pool.stop().await;
            write_summary(&mut out, &graph)?;
            match result {
                Ok(()) => writeln!(out, "Sprint {} complete.", list.project_name)?,
                Err(ExecutorError::TasksFailed { failed, skipped }) => {
                    for id in &failed {
                        let reason = graph
                            .node(id)
                            .and_then(|n| n.error.clone())
                            .unwrap_or_default();
                        writeln!(out, "  failed:  {id} {reason}")?;
                    }
                    for id in &skipped {
                        writeln!(out, "  skipped: {id}")?;
                    }
                    anyhow::bail!(
                        "sprint {} incomplete: {} failed, {} skipped",
                        list.project_name,
                        failed.len(),
                        skipped.len()
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<(TaskGraph, FeatureList)> {
    let mut graph = TaskGraph::new();
    let list = graph.load_from_feature_list(path)?;
    graph.validate()?;
    Ok((graph, list))
}

/// Register one agent task per unfinished feature and execute the graph.
pub async fn run_sprint(
    graph: &mut TaskGraph,
    list: &FeatureList,
    pool: &WorkerPool,
    agent: Arc<dyn Agent>,
    cancel: CancellationToken,
) -> Result<(), ExecutorError> {
    let mut executor = DependencyExecutor::new(graph, pool).with_cancellation(cancel);
    for feature in list.features.iter().filter(|f| !f.is_complete()) {
        let agent = Arc::clone(&agent);
        let prompt = feature_prompt(&list.project_name, feature);
        let id = feature.id.clone();
        executor.register_task(feature.id.clone(), move |worker_id| async move {
            info!(feature = %id, worker_id, "Feature started");
            let mut on_chunk = |chunk: &str| debug!(feature = %id, "{chunk}");
            agent.send_stream(&prompt, &mut on_chunk).await?;
            info!(feature = %id, worker_id, "Feature finished");
            Ok(())
        });
    }
    let report = executor.execute().await?;
    info!(
        completed = report.completed.len(),
        elapsed_ms = report.elapsed.as_millis(),
        "Sprint finished"
    );
    Ok(())
}

pub fn feature_prompt(project: &str, feature: &Feature) -> String {
    let mut prompt = format!(
        "Project: {project}\nImplement feature {}: {}",
        feature.id, feature.description
    );
    if !feature.dependencies.depends_on_ids.is_empty() {
        prompt.push_str(&format!(
            "\nIt builds on: {}",
            feature.dependencies.depends_on_ids.join(", ")
        ));
    }
    prompt
}

pub fn write_plan(w: &mut impl Write, graph: &TaskGraph, list: &FeatureList) -> anyhow::Result<()> {
    let order = graph.topological_sort_with_priority()?;
    writeln!(w, "Sprint plan for {} ({} features):", list.project_name, order.len())?;
    for (i, id) in order.iter().enumerate() {
        let Some(node) = graph.node(id) else { continue };
        let marker = if node.status == TaskStatus::Done { "done" } else { "todo" };
        writeln!(
            w,
            "{:>3}. [{marker}] {:<16} {:<10} {}",
            i + 1,
            node.id,
            node.priority,
            node.name
        )?;
    }
    Ok(())
}

fn write_summary(w: &mut impl Write, graph: &TaskGraph) -> io::Result<()> {
    let summary = graph.task_summary();
    let count = |status: TaskStatus| summary.get(&status).copied().unwrap_or(0);
    writeln!(
        w,
        "Tasks: {} done, {} failed, {} pending",
        count(TaskStatus::Done),
        count(TaskStatus::Failed),
        count(TaskStatus::Pending) + count(TaskStatus::Running),
    )
}
