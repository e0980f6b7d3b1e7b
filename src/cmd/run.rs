//! Full workflow execution (`crewforge run`).

use anyhow::{Context, Result, bail};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crewforge::audit::{AuditLogger, AuditRun};
use crewforge::config::{CONFIG_DIR, CrewforgeToml, HostingSection};
use crewforge::gates::{Decision, PendingApproval};
use crewforge::generate::CommandGenerator;
use crewforge::hosting::GitHubHost;
use crewforge::metrics::JsonlMetricsSink;
use crewforge::notify::{ConsoleSink, WebhookSink};
use crewforge::orchestrator::{Orchestrator, ProjectResult};

use super::super::RunArgs;

fn read_manifesto(args: &RunArgs) -> Result<String> {
    let manifesto = match (&args.manifesto, &args.manifesto_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read manifesto: {}", path.display()))?,
        (None, None) => bail!("Provide a manifesto file or --manifesto <TEXT>."),
    };
    if manifesto.trim().is_empty() {
        bail!("Manifesto is empty.");
    }
    Ok(manifesto)
}

fn build_host(hosting: &HostingSection, repo: Option<&str>) -> Result<Option<GitHubHost>> {
    let Some(repo) = repo.or(hosting.repo.as_deref()) else {
        return Ok(None);
    };
    let mut host = GitHubHost::from_env(repo)?;
    if let Some(api_url) = &hosting.api_url {
        host = host.with_api_url(api_url.clone());
    }
    Ok(Some(host))
}

/// Ask on the terminal for every checkpoint that arrives.
async fn prompt_approvals(mut rx: mpsc::Receiver<PendingApproval>) {
    while let Some(pending) = rx.recv().await {
        println!();
        println!(
            "{} {} {}",
            style("Approval required:").yellow().bold(),
            style(pending.phase).cyan(),
            style(format!("(run {})", pending.run_id)).dim()
        );
        println!("{}", style("─".repeat(60)).dim());
        println!("{}", pending.snapshot);
        println!("{}", style("─".repeat(60)).dim());

        let decision = tokio::task::spawn_blocking(ask_decision)
            .await
            .unwrap_or_else(|e| Ok(Decision::rejected(format!("prompt task failed: {}", e))))
            .unwrap_or_else(|e| Decision::rejected(format!("prompt failed: {}", e)));
        pending.decide(decision);
    }
}

fn ask_decision() -> Result<Decision> {
    use dialoguer::{Input, Select, theme::ColorfulTheme};

    let options = &["Approve and continue", "Reject and stop the run"];
    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Proceed?")
        .items(options)
        .default(0)
        .interact()?;

    if selection == 0 {
        return Ok(Decision::Approved);
    }
    let reason: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Reason")
        .default("rejected by operator".to_string())
        .interact_text()?;
    Ok(Decision::rejected(reason))
}

fn print_summary(result: &ProjectResult, audit_file: Option<&PathBuf>) {
    println!();
    let headline = if result.succeeded() {
        style("Run succeeded").green().bold()
    } else {
        style("Run failed").red().bold()
    };
    println!("{}  {}", headline, style(result.run_id).dim());
    println!();

    for phase in &result.phase_results {
        println!(
            "  {:<12} {:<15} {:>8} tokens  {:?}",
            phase.phase.to_string(),
            phase.role.to_string(),
            phase.tokens_used,
            phase.status
        );
    }
    println!();
    println!("  Tests passed: {}", result.tests_passed);
    if result.iterations > 1 {
        println!("  Iterations:   {}", result.iterations);
    }
    println!("  Total tokens: {}", result.token_totals.total());
    println!(
        "  Context: {} / {} tokens, {} summarization(s)",
        result.context.running,
        result.context.limit,
        result.context.segments.len()
    );
    if !result.agent_events.is_empty() {
        println!("  Roster changes: {}", result.agent_events.len());
    }
    if let Some(pr) = &result.pr_handle {
        println!("  Change request: #{} {}", pr.number, style(&pr.url).underlined());
    }
    if let Some(halt) = &result.halt {
        println!("  {} {}: {}", style("Halted in").red(), halt.phase, halt.reason);
    }
    if let Some(path) = audit_file {
        println!("  Audit: {}", path.display());
    }
    println!();
}

pub async fn cmd_run(project_dir: &Path, args: &RunArgs) -> Result<()> {
    let toml = CrewforgeToml::load_or_default(project_dir)?;
    let mut config = toml.run.clone();
    config.apply_env()?;
    if args.yes {
        config.auto_approve = true;
    }
    if args.auto_merge {
        config.auto_merge = true;
    }
    if args.no_pr {
        config.create_pr = false;
        config.auto_merge = false;
    }
    if let Some(budget) = args.budget {
        config.budget_limit = budget;
    }
    if let Some(iterations) = args.iterations {
        config.max_iterations = iterations;
    }
    if let Some(head) = &args.head {
        config.head_branch = Some(head.clone());
    }

    let manifesto = read_manifesto(args)?;

    let generator = CommandGenerator::from_config(&toml.generator).working_dir(project_dir);
    let mut builder = Orchestrator::builder(Arc::new(generator)).sink(Arc::new(ConsoleSink));

    if config.create_pr {
        let Some(host) = build_host(&toml.hosting, args.repo.as_deref())? else {
            bail!(
                "create_pr is set but no repository is configured. \
                 Set [hosting].repo, pass --repo, or run with --no-pr."
            );
        };
        builder = builder.host(Arc::new(host));
    }

    if let Some(url) = toml.notifications.webhook_url() {
        builder = builder.sink(Arc::new(WebhookSink::new(url)));
    }

    let crewforge_dir = project_dir.join(CONFIG_DIR);
    let metrics_path = crewforge_dir.join("metrics").join("metrics.jsonl");
    builder = builder.metrics(Arc::new(JsonlMetricsSink::open(&metrics_path)?));

    let prompter = if config.auto_approve {
        None
    } else {
        let (tx, rx) = mpsc::channel(1);
        builder = builder.approvals(tx);
        Some(tokio::spawn(prompt_approvals(rx)))
    };

    let orchestrator = builder.build();
    let result = orchestrator.run(&manifesto, &config).await?;
    drop(orchestrator);
    if let Some(prompter) = prompter {
        prompter.abort();
    }

    let audit = AuditLogger::new(&crewforge_dir.join("audit"));
    let audit_file = match audit.write_run(&AuditRun::new(&manifesto, &config, &result)) {
        Ok(path) => Some(path),
        Err(e) => {
            tracing::warn!(error = %e, "failed to write audit file");
            None
        }
    };

    print_summary(&result, audit_file.as_ref());
    if !result.succeeded() {
        bail!("run {} did not complete", result.run_id);
    }
    Ok(())
}
