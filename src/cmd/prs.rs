//! Change-request listing (`crewforge prs`).

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use crewforge::config::CrewforgeToml;
use crewforge::hosting::{GitHubHost, PrState, SourceHost};

use super::super::PrStateArg;

impl From<PrStateArg> for PrState {
    fn from(arg: PrStateArg) -> Self {
        match arg {
            PrStateArg::Open => PrState::Open,
            PrStateArg::Closed => PrState::Closed,
            PrStateArg::All => PrState::All,
        }
    }
}

pub async fn cmd_prs(project_dir: &Path, state: PrStateArg, repo: Option<String>) -> Result<()> {
    let toml = CrewforgeToml::load_or_default(project_dir)?;
    let Some(repo) = repo.or(toml.hosting.repo.clone()) else {
        bail!("No repository configured. Pass --repo or set [hosting].repo in crewforge.toml.");
    };

    let mut host = GitHubHost::from_env(&repo)?;
    if let Some(api_url) = &toml.hosting.api_url {
        host = host.with_api_url(api_url.clone());
    }

    let state = PrState::from(state);
    let prs = host.list(state).await?;
    if prs.is_empty() {
        println!("No {} change requests on {}.", state, host.slug());
        return Ok(());
    }

    println!();
    println!("{} ({})", style(host.slug()).bold(), state);
    println!();
    for pr in &prs {
        println!(
            "  {:>6}  {:<8} {}  {}",
            style(format!("#{}", pr.number)).cyan(),
            pr.state.to_string(),
            pr.title,
            style(format!("{} -> {}", pr.head, pr.base)).dim()
        );
    }
    println!();
    Ok(())
}
