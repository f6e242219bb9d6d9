mod config;
mod process_adapters;
mod serve_cmd;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use fabric_core::agents::{AgentRuntimeRegistry, Controller};
use fabric_core::executor::{TaskExecutor, TaskExecutorConfig};
use fabric_core::token::guard;
use fabric_core::workflow::WorkflowEngine;
use fabric_db::pool;

use config::FabricConfig;
use process_adapters::{ProcessAgent, ProcessLlmPort, ProcessStepExecutor};

#[derive(Parser)]
#[command(name = "fabric", about = "Multi-tenant AI task orchestration execution fabric")]
struct Cli {
    /// Database URL (overrides FABRIC_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fabric config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/fabric")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the fabric database (requires config file or env vars)
    DbInit,
    /// Workspace and project administration
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommands,
    },
    /// Task Executor operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Workflow Engine operations
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Approval Gate operations
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Multi-Agent Controller operations
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Serve the read-side HTTP API
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum WorkspaceCommands {
    /// Create a workspace
    Create { name: String },
    /// List workspaces
    List,
    /// Create a project within a workspace
    CreateProject {
        workspace_id: String,
        name: String,
        #[arg(long)]
        repo_url: Option<String>,
        #[arg(long, default_value = "fabric/")]
        branch_prefix: String,
        #[arg(long, default_value = "[fabric] {task_name}")]
        commit_template: String,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create a task within a project
    Create {
        project_id: String,
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value_t = 3)]
        max_rounds: i32,
        #[arg(long, default_value_t = 3)]
        max_revision_rounds: i32,
    },
    /// List tasks for a project
    List { project_id: String },
    /// Show a task's detail, including run history
    Show { task_id: String },
    /// Start a new run for a task, driving it through analyze/plan and (if
    /// auto-approved) execute/finalize
    Run {
        task_id: String,
        /// Command to invoke for LLM completions: stdin is a JSON
        /// CompletionRequest, stdout must be a JSON CompletionResponse
        #[arg(long)]
        llm_command: String,
        #[arg(long)]
        llm_arg: Vec<String>,
    },
    /// Approve a run's plan, continuing it through execute/finalize
    ApprovePlan {
        task_id: String,
        run_id: String,
        #[arg(long)]
        llm_command: String,
        #[arg(long)]
        llm_arg: Vec<String>,
    },
    /// Reject a run's plan
    RejectPlan {
        task_id: String,
        run_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Cancel a task's active run
    Cancel { task_id: String, run_id: String },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Define a workflow from a TOML file
    Create {
        workspace_id: String,
        project_id: String,
        file: String,
    },
    /// List workflows for a project
    List { project_id: String },
    /// Validate a workflow TOML file without persisting it
    Validate { file: String },
    /// Start a new execution of a workflow
    Start {
        workflow_id: String,
        /// JSON object of input variables (default: {})
        #[arg(long, default_value = "{}")]
        input: String,
        #[arg(long)]
        agent: Vec<String>,
    },
    /// Respond to a pending approval step, continuing the execution
    RespondToApproval {
        workflow_id: String,
        execution_id: String,
        step_execution_id: String,
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        agent: Vec<String>,
    },
    /// Cancel a running execution
    Cancel { execution_id: String },
    /// Show an execution's current status
    Show { execution_id: String },
}

#[derive(Subcommand)]
enum ApprovalCommands {
    /// List approvals awaiting a human decision
    ListPending,
    /// Approve, reject, or request changes on a pending approval
    Respond {
        approval_id: String,
        #[arg(value_enum)]
        decision: ApprovalDecisionArg,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        feedback: Option<String>,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum ApprovalDecisionArg {
    Approve,
    Reject,
    RequestChanges,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Register a new agent role/definition
    RegisterDefinition {
        role: String,
        name: String,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
    /// Register a runnable instance of a definition
    RegisterInstance {
        definition_id: String,
        name: String,
        #[arg(long, value_delimiter = ',')]
        capabilities: Vec<String>,
    },
}

/// Execute the `fabric init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let token_secret = config::generate_token_secret();

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        auth: config::AuthSection {
            token_secret: token_secret.clone(),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!("  auth.token_secret = {}...{}", &token_secret[..8], &token_secret[56..]);
    println!();
    println!("Next: run `fabric db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `fabric db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FabricConfig::resolve(cli_db_url)?;

    println!("Initializing fabric database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("fabric db-init complete.");
    Ok(())
}

fn parse_uuid(label: &str, raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid {label}: {raw}"))
}

/// Parse `role=command` flags into registered process agents.
fn parse_agent_flags(flags: &[String]) -> anyhow::Result<Vec<ProcessAgent>> {
    flags
        .iter()
        .map(|flag| {
            let (role, command) = flag
                .split_once('=')
                .with_context(|| format!("--agent must be role=command, got {flag}"))?;
            Ok(ProcessAgent::new(role.to_string(), command.to_string(), Vec::new()))
        })
        .collect()
}

async fn run_workspace_command(command: WorkspaceCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    use fabric_db::queries::workspaces;
    match command {
        WorkspaceCommands::Create { name } => {
            let workspace = workspaces::insert_workspace(pool, &name).await?;
            println!("{} {}", workspace.id, workspace.name);
        }
        WorkspaceCommands::List => {
            for workspace in workspaces::list_workspaces(pool).await? {
                println!("{} {}", workspace.id, workspace.name);
            }
        }
        WorkspaceCommands::CreateProject {
            workspace_id,
            name,
            repo_url,
            branch_prefix,
            commit_template,
        } => {
            let workspace_id = parse_uuid("workspace ID", &workspace_id)?;
            let project = workspaces::insert_project(
                pool,
                workspace_id,
                &name,
                repo_url.as_deref(),
                &branch_prefix,
                &commit_template,
            )
            .await?;
            println!("{} {}", project.id, project.name);
        }
    }
    Ok(())
}

async fn run_task_command(command: TaskCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    use fabric_db::queries::{task_runs, tasks};

    match command {
        TaskCommands::Create {
            project_id,
            name,
            description,
            max_rounds,
            max_revision_rounds,
        } => {
            let project_id = parse_uuid("project ID", &project_id)?;
            let project = fabric_db::queries::workspaces::get_project(pool, project_id)
                .await?
                .with_context(|| format!("project {project_id} not found"))?;
            let task = tasks::insert_task(
                pool,
                project.workspace_id,
                project_id,
                &name,
                &description,
                &serde_json::json!({}),
                max_rounds,
                max_revision_rounds,
                None,
                None,
            )
            .await?;
            println!("{} {}", task.id, task.name);
        }
        TaskCommands::List { project_id } => {
            let project_id = parse_uuid("project ID", &project_id)?;
            for task in tasks::list_tasks_for_project(pool, project_id).await? {
                println!(
                    "{} {} status={:?} runs(ok={} fail={} active={})",
                    task.id, task.name, task.status, task.successful_runs, task.failed_runs, task.in_progress_runs
                );
            }
        }
        TaskCommands::Show { task_id } => {
            let task_id = parse_uuid("task ID", &task_id)?;
            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            println!("{} {} status={:?}", task.id, task.name, task.status);
            for run in task_runs::list_runs_for_task(pool, task_id).await? {
                println!("  run {} #{} phase={:?}", run.id, run.run_number, run.phase);
            }
        }
        TaskCommands::Run {
            task_id,
            llm_command,
            llm_arg,
        } => {
            let task_id = parse_uuid("task ID", &task_id)?;
            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let executor = build_task_executor(pool.clone(), &llm_command, llm_arg);
            let outcome = executor.run_task(&task, CancellationToken::new()).await?;
            println!("run {} phase={:?}", outcome.run_id, outcome.phase);
        }
        TaskCommands::ApprovePlan {
            task_id,
            run_id,
            llm_command,
            llm_arg,
        } => {
            let task_id = parse_uuid("task ID", &task_id)?;
            let run_id = parse_uuid("run ID", &run_id)?;
            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let run = task_runs::get_task_run(pool, run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            let executor = build_task_executor(pool.clone(), &llm_command, llm_arg);
            let outcome = executor.approve_plan(&task, run, CancellationToken::new()).await?;
            println!("run {} phase={:?}", outcome.run_id, outcome.phase);
        }
        TaskCommands::RejectPlan { task_id, run_id, reason } => {
            let task_id = parse_uuid("task ID", &task_id)?;
            let run_id = parse_uuid("run ID", &run_id)?;
            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let executor = build_task_executor(pool.clone(), "true", Vec::new());
            executor.reject_plan(&task, run_id, &reason).await?;
            println!("run {run_id} rejected: {reason}");
        }
        TaskCommands::Cancel { task_id, run_id } => {
            let task_id = parse_uuid("task ID", &task_id)?;
            let run_id = parse_uuid("run ID", &run_id)?;
            let task = tasks::get_task(pool, task_id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;
            let executor = build_task_executor(pool.clone(), "true", Vec::new());
            executor.cancel_run(&task, run_id).await?;
            println!("run {run_id} cancelled");
        }
    }
    Ok(())
}

fn build_task_executor(pool: sqlx::PgPool, llm_command: &str, llm_args: Vec<String>) -> TaskExecutor {
    let llm = Arc::new(ProcessLlmPort::new(llm_command.to_string(), llm_args));
    let agents = Arc::new(Controller::new(pool.clone()));
    let runtimes = Arc::new(AgentRuntimeRegistry::new());
    TaskExecutor::new(
        pool,
        llm,
        agents,
        runtimes,
        None,
        None,
        None,
        TaskExecutorConfig::default(),
    )
}

async fn run_workflow_command(command: WorkflowCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let engine = WorkflowEngine::new(pool.clone(), 4);

    match command {
        WorkflowCommands::Create {
            workspace_id,
            project_id,
            file,
        } => {
            let workspace_id = parse_uuid("workspace ID", &workspace_id)?;
            let project_id = parse_uuid("project ID", &project_id)?;
            let toml_content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {file}"))?;
            let workflow = engine
                .define_workflow(workspace_id, project_id, &toml_content)
                .await?;
            println!("{} {}", workflow.id, workflow.name);
        }
        WorkflowCommands::List { project_id } => {
            let project_id = parse_uuid("project ID", &project_id)?;
            for workflow in fabric_db::queries::workflows::list_workflows_for_project(pool, project_id).await? {
                println!("{} {}", workflow.id, workflow.name);
            }
        }
        WorkflowCommands::Validate { file } => {
            let toml_content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {file}"))?;
            let parsed = engine
                .validate_workflow(&toml_content)
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("valid: {} ({} steps)", parsed.workflow.name, parsed.steps.len());
        }
        WorkflowCommands::Start {
            workflow_id,
            input,
            agent,
        } => {
            let workflow_id = parse_uuid("workflow ID", &workflow_id)?;
            let input_variables: serde_json::Value = serde_json::from_str(&input)
                .context("--input must be valid JSON")?;
            let executor = Arc::new(ProcessStepExecutor::new(parse_agent_flags(&agent)?));
            let (execution, outcome) = engine
                .start_execution(workflow_id, input_variables, executor, None, CancellationToken::new())
                .await?;
            println!("execution {} status={:?} outcome={:?}", execution.id, execution.status, outcome);
        }
        WorkflowCommands::RespondToApproval {
            workflow_id,
            execution_id,
            step_execution_id,
            approve,
            agent,
        } => {
            let workflow_id = parse_uuid("workflow ID", &workflow_id)?;
            let execution_id = parse_uuid("execution ID", &execution_id)?;
            let step_execution_id = parse_uuid("step execution ID", &step_execution_id)?;
            let executor = Arc::new(ProcessStepExecutor::new(parse_agent_flags(&agent)?));
            let outcome = engine
                .respond_to_approval(
                    workflow_id,
                    execution_id,
                    step_execution_id,
                    approve,
                    executor,
                    None,
                    CancellationToken::new(),
                )
                .await?;
            println!("outcome={outcome:?}");
        }
        WorkflowCommands::Cancel { execution_id } => {
            let execution_id = parse_uuid("execution ID", &execution_id)?;
            engine.cancel_execution(execution_id).await?;
            println!("execution {execution_id} cancelled");
        }
        WorkflowCommands::Show { execution_id } => {
            let execution_id = parse_uuid("execution ID", &execution_id)?;
            let execution = engine.get_execution(execution_id).await?;
            println!("{} status={:?}", execution.id, execution.status);
        }
    }
    Ok(())
}

async fn run_approval_command(command: ApprovalCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    use fabric_core::approval::{Decision, Gate};

    let gate = Gate::new(pool.clone());
    match command {
        ApprovalCommands::ListPending => {
            for approval in gate.list_pending().await? {
                println!("{} {} status={:?}", approval.id, approval.title, approval.status);
            }
        }
        ApprovalCommands::Respond {
            approval_id,
            decision,
            approver,
            feedback,
        } => {
            let approval_id = parse_uuid("approval ID", &approval_id)?;
            let decision = match decision {
                ApprovalDecisionArg::Approve => Decision::Approved,
                ApprovalDecisionArg::Reject => Decision::Rejected,
                ApprovalDecisionArg::RequestChanges => Decision::RequestChanges,
            };
            let resolved = gate
                .respond(approval_id, decision, &approver, feedback.as_deref(), None)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{} status={:?}", resolved.id, resolved.status);
        }
    }
    Ok(())
}

async fn run_agent_command(command: AgentCommands, pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let controller = Controller::new(pool.clone());
    match command {
        AgentCommands::RegisterDefinition { role, name, capabilities } => {
            let definition = controller.register_definition(&role, &name, &capabilities).await?;
            println!("{} role={} name={}", definition.id, definition.role, definition.name);
        }
        AgentCommands::RegisterInstance {
            definition_id,
            name,
            capabilities,
        } => {
            let definition_id = parse_uuid("definition ID", &definition_id)?;
            let instance = controller
                .register_instance(definition_id, &name, &capabilities)
                .await?;
            println!("{} {}", instance.id, instance.name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if guard::is_agent_mode() {
        anyhow::bail!(
            "FABRIC_AGENT_TOKEN is set; this binary's command surface is operator-only. \
             Agent-side task interaction goes through the live execution commands \
             (`fabric task run`/`approve-plan`), not a separate restricted mode."
        );
    }

    if let Commands::Init { db_url, force } = &cli.command {
        return cmd_init(db_url, *force);
    }
    if matches!(cli.command, Commands::DbInit) {
        return cmd_db_init(cli.database_url.as_deref()).await;
    }

    let resolved = FabricConfig::resolve(cli.database_url.as_deref())?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let result = match cli.command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled above"),
        Commands::Workspace { command } => run_workspace_command(command, &db_pool).await,
        Commands::Task { command } => run_task_command(command, &db_pool).await,
        Commands::Workflow { command } => run_workflow_command(command, &db_pool).await,
        Commands::Approval { command } => run_approval_command(command, &db_pool).await,
        Commands::Agent { command } => run_agent_command(command, &db_pool).await,
        Commands::Serve { bind, port } => serve_cmd::run_serve(db_pool.clone(), &bind, port).await,
    };

    db_pool.close().await;
    result
}
