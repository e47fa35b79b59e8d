use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Display;
use std::sync::Arc;

use flowkeeper::flows::graphs;
use flowkeeper::{
    init_config, init_telemetry, Credentials, FlowIdentity, FlowkeeperConfig, InMemoryGateway,
    InstrumentedGateway, LoginController, LoginState, ReconciliationService, RegistrationController,
    RegistrationForm, ReconcileError, ReportOutcome, StateGraph, StepOutcome, SyncOutcome, Tag, WorkflowState,
};

type DemoGateway = InstrumentedGateway<InMemoryGateway>;

/// Accounts seeded into the in-memory gateway for the login demo
const DEMO_USERS: &[(&str, &str, Option<&str>)] = &[
    ("ada@example.com", "lovelace", None),
    ("grace@example.com", "hopper", Some("123456")),
];

#[derive(Parser)]
#[command(name = "flowkeeper")]
#[command(about = "State-machine driven login, registration and workflow flows")]
#[command(long_about = "Flowkeeper drives login and registration flows through explicit state graphs \
                       and keeps a user's workflow state reconciled with a remote service. This binary \
                       runs the flows against an in-memory gateway.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the states and transition table of a built-in graph
    Graph {
        #[arg(value_enum)]
        flow: FlowKind,
    },
    /// Run the login flow (demo accounts: ada@example.com/lovelace, grace@example.com/hopper)
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        /// Second-factor code, if the account asks for one
        #[arg(long)]
        mfa_code: Option<String>,
    },
    /// Run registration including email verification
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        username: String,
    },
    /// Start a reconciled workflow and report a new state to the remote side
    Workflow {
        #[arg(long)]
        email: String,
        /// Target state: initial, registration, login, completed or error
        #[arg(long)]
        to: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FlowKind {
    Login,
    Registration,
    Workflow,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    FlowkeeperConfig::load_env_file()?;
    let config = init_config()?;
    init_telemetry(&config.observability)?;

    match cli.command {
        Commands::Graph { flow } => graph_command(flow),
        Commands::Login {
            email,
            password,
            mfa_code,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            login_command(config, email, password, mfa_code).await
        }),
        Commands::Register {
            email,
            password,
            username,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            register_command(config, email, password, username).await
        }),
        Commands::Workflow { email, to } => {
            tokio::runtime::Runtime::new()?.block_on(async { workflow_command(config, email, to).await })
        }
    }
}

fn graph_command(flow: FlowKind) -> Result<()> {
    match flow {
        FlowKind::Login => print_graph(&graphs::login()?),
        FlowKind::Registration => print_graph(&graphs::registration()?),
        FlowKind::Workflow => print_graph(&graphs::workflow()?),
    }
    Ok(())
}

fn print_graph<S: Tag, E: Tag>(graph: &StateGraph<S, E>) {
    println!("📊 Graph: {}", graph.name());
    println!("   Initial: {}", graph.initial());
    println!("   Terminal: {}", join(graph.terminals()));
    println!("   States: {}", join(graph.states()));
    println!();
    println!("🔀 Transitions:");
    for (from, event, to) in graph.transitions() {
        println!("   {:<20} --{}--> {}", from.name(), event, to);
    }
}

fn join<T: Display>(items: impl Iterator<Item = T>) -> String {
    items.map(|item| item.to_string()).collect::<Vec<_>>().join(", ")
}

async fn login_command(
    config: &FlowkeeperConfig,
    email: String,
    password: String,
    mfa_code: Option<String>,
) -> Result<()> {
    let seeded = DEMO_USERS
        .iter()
        .fold(InMemoryGateway::new(), |gateway, (user, secret, code)| match code {
            Some(code) => gateway.with_second_factor_user(user, secret, code),
            None => gateway.with_user(user, secret),
        });
    let gateway = Arc::new(InstrumentedGateway::new(seeded));

    let mut login =
        LoginController::new(gateway.clone())?.with_trim_whitespace(config.validation.trim_whitespace);
    login.subscribe(|t| println!("   {} --{}--> {}", t.from, t.event, t.to));

    println!("🔐 Logging in as {}", email);
    login.open_form();
    let mut outcome = login.submit(Credentials::new(email, password)).await;

    if outcome.state() == LoginState::MfaRequired {
        let Some(code) = mfa_code else {
            println!("🔑 This account needs a second factor; pass --mfa-code");
            return Ok(());
        };
        outcome = login.submit_second_factor(&code).await;
    }

    report_step(&outcome);
    print_metrics(&gateway);
    Ok(())
}

async fn register_command(
    config: &FlowkeeperConfig,
    email: String,
    password: String,
    username: String,
) -> Result<()> {
    let gateway = Arc::new(InstrumentedGateway::new(InMemoryGateway::new()));

    let mut registration =
        RegistrationController::new(gateway.clone())?.with_trim_whitespace(config.validation.trim_whitespace);
    registration.subscribe(|t| println!("   {} --{}--> {}", t.from, t.event, t.to));

    println!("📝 Registering {}", email);
    registration.open_form();
    let outcome = registration
        .submit(RegistrationForm::new(email.clone(), password, username))
        .await;

    if let StepOutcome::Advanced { .. } = outcome {
        let token = gateway
            .inner()
            .pending_verification_token(&email)
            .ok_or_else(|| anyhow!("No verification token was issued for {}", email))?;
        println!("📧 Verification token: {}", token);
        let outcome = registration.verify_email(&token).await;
        report_step(&outcome);
    } else {
        report_step(&outcome);
    }

    print_metrics(&gateway);
    Ok(())
}

async fn workflow_command(config: &FlowkeeperConfig, email: String, to: String) -> Result<()> {
    let target = WorkflowState::from_name_ignore_case(&to).ok_or_else(|| {
        anyhow!(
            "Unknown workflow state '{}'; expected one of: {}",
            to,
            join(WorkflowState::ALL.iter())
        )
    })?;

    let seeded = InMemoryGateway::new().with_flow_state(&email, "initial", serde_json::json!({}));
    let gateway = Arc::new(InstrumentedGateway::new(seeded));
    let service = Arc::new(ReconciliationService::workflow(
        FlowIdentity::new(email.clone()),
        gateway.clone(),
    )?);
    service.subscribe(|t| println!("   {} --{}--> {}", t.from, t.event, t.to));

    println!("🔄 Reconciling workflow for {}", email);
    match service.start().await? {
        SyncOutcome::InSync { state } => println!("✅ Local state {} matches remote", state),
        other => println!("⚠️  Initial sync: {:?}", other),
    }

    let periodic = config
        .reconciliation
        .periodic_sync
        .then(|| service.spawn_periodic_sync(config.reconciliation.sync_interval()));

    match service.transition(target, serde_json::json!({ "source": "cli" })).await {
        Err(ReconcileError::IllegalTransition { from, to }) => {
            println!("⚠️  No transition from {} to {}; the remote was left alone", from, to)
        }
        Err(e) => return Err(e.into()),
        Ok(ReportOutcome::Applied(outcome)) if outcome.is_transitioned() => {
            println!("✅ Remote and local state are now {}", outcome.state())
        }
        Ok(ReportOutcome::Applied(outcome)) => {
            println!("⚠️  Remote accepted {} but the local machine stayed in {}", target, outcome.state())
        }
        Ok(ReportOutcome::RemoteFailed { reason, outcome }) => {
            println!("❌ Remote refused: {}", reason);
            println!("   Local state is now {}", outcome.state());
        }
        Ok(ReportOutcome::Discarded) => println!("⚠️  Service stopped before the report completed"),
    }

    // Aborts the periodic task
    service.stop().await;
    if let Some(handle) = periodic {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                return Err(e.into());
            }
        }
    }

    print_metrics(&gateway);
    Ok(())
}

fn report_step<S: Tag, E: Tag>(outcome: &StepOutcome<S, E>) {
    match outcome {
        StepOutcome::Advanced { state } => println!("✅ Flow is now in {}", state),
        StepOutcome::Invalid { error, state } => println!("❌ {} (still in {})", error, state),
        StepOutcome::Failed { reason, state } => println!("❌ {} (back in {})", reason, state),
        StepOutcome::OutOfSequence { state, event } => {
            println!("⚠️  {} is not allowed from {}", event, state)
        }
    }
}

fn print_metrics(gateway: &DemoGateway) {
    let metrics = gateway.metrics();
    metrics.log_stats();
    let stats = metrics.get_stats();
    println!();
    println!(
        "📈 Gateway calls: {} ({} failed)",
        stats.total_requests, stats.failures
    );
}
