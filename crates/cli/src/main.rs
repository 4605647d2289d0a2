// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// SSH Chain - CLI
// Resolve, compose and connect multi-hop SSH chains from tunnel profiles

mod hosts;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ssh_chain_common::{
    compose, load_profile, resolve_from_local, validate, ForwardDestination, HopPlan,
    HostKeyPolicy, NodeKind, ProfileStore, Severity, TunnelNode, TunnelProfile,
};
use ssh_chain_connect::{materialize_credentials, ChainBuilder, ConnectionHandle, RusshConnector};

use hosts::HostBook;

#[derive(Parser)]
#[command(name = "ssh-chain")]
#[command(about = "Multi-hop SSH chains from tunnel graphs", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Host book used to resolve host references
    #[arg(long, global = true, value_name = "FILE")]
    hosts: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a profile's graph and print every issue
    Validate {
        /// Profile name, UUID or path to a TOML file
        profile: String,
    },

    /// Print the hop order a profile resolves to
    Resolve {
        /// Profile name, UUID or path to a TOML file
        profile: String,
    },

    /// Print the equivalent ssh command line
    Compose {
        /// Profile name, UUID or path to a TOML file
        profile: String,
    },

    /// Build the chain and attach the terminal to the target shell
    Connect {
        /// Profile name, UUID or path to a TOML file
        profile: String,

        /// Trust and remember host keys seen for the first time
        #[arg(long)]
        accept_new: bool,
    },

    /// Build the chain, run one command on the target and disconnect
    Exec {
        /// Profile name, UUID or path to a TOML file
        profile: String,

        /// Command to run on the target
        command: String,

        /// Seconds to wait for the command (default: profile setting)
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Trust and remember host keys seen for the first time
        #[arg(long)]
        accept_new: bool,
    },

    /// List saved profiles
    List {
        /// Output as JSON for scripting
        #[arg(short, long)]
        json: bool,
    },

    /// Show a profile's nodes and edges
    Show {
        /// Profile name, UUID or path to a TOML file
        profile: String,
    },

    /// Validate a profile file and add it to the profile store
    Import {
        /// TOML profile file
        file: PathBuf,

        /// Replace an existing profile with the same id or name
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let store = ProfileStore::open_default()?;

    match cli.command {
        Commands::Validate { profile } => validate_profile(&store, &profile),
        Commands::Resolve { profile } => resolve_profile(&store, &profile),
        Commands::Compose { profile } => {
            compose_profile(&store, &profile, cli.hosts.as_deref()).await
        }
        Commands::Connect {
            profile,
            accept_new,
        } => connect(&store, &profile, cli.hosts.as_deref(), accept_new).await,
        Commands::Exec {
            profile,
            command,
            timeout,
            accept_new,
        } => {
            exec(
                &store,
                &profile,
                &command,
                timeout,
                cli.hosts.as_deref(),
                accept_new,
            )
            .await
        }
        Commands::List { json } => list_profiles(&store, json),
        Commands::Show { profile } => show_profile(&store, &profile),
        Commands::Import { file, force } => import_profile(&store, &file, force),
    }
}

/// Logs go to stderr so stdout stays free for shell output
fn init_logging(verbose: u8) {
    let default_filter = match verbose {
        0 => "warn,ssh_chain=info",
        1 => "warn,ssh_chain=debug",
        _ => "warn,ssh_chain=trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn find_profile(store: &ProfileStore, reference: &str) -> Result<TunnelProfile> {
    store
        .find(reference)
        .with_context(|| format!("Profile '{}' not found", reference))
}

fn load_host_book(path: Option<&Path>) -> Result<HostBook> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => HostBook::default_path()?,
    };
    HostBook::load(&path)
}

fn validate_profile(store: &ProfileStore, reference: &str) -> Result<()> {
    let profile = find_profile(store, reference)?;
    let issues = validate(&profile);

    if issues.iter().next().is_none() {
        println!(
            "{}",
            format!("✓ Profile '{}' is valid", profile.metadata.name)
                .green()
                .bold()
        );
        return Ok(());
    }

    println!();
    for issue in issues.iter() {
        match issue.severity {
            Severity::Error => println!("  {} {}", "✗".red().bold(), issue.to_string().red()),
            Severity::Warning => println!("  {} {}", "⚠️ ".yellow(), issue.to_string().yellow()),
        }
    }
    println!();

    let errors = issues.errors().count();
    if errors > 0 {
        bail!(
            "Profile '{}' has {} error(s)",
            profile.metadata.name,
            errors
        );
    }

    println!(
        "{}",
        format!(
            "✓ Profile '{}' is usable ({} warning(s))",
            profile.metadata.name,
            issues.warnings().count()
        )
        .green()
    );
    Ok(())
}

fn resolve_profile(store: &ProfileStore, reference: &str) -> Result<()> {
    let profile = find_profile(store, reference)?;
    let plan = resolve_from_local(&profile)
        .with_context(|| format!("Failed to resolve '{}'", profile.metadata.name))?;

    let path: Vec<String> = plan.kinds().iter().map(|k| k.to_string()).collect();
    println!();
    println!("{} {}", "Path:".bold(), path.join(" → "));

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["#", "Role", "Node", "Host ref"]));

    let hop_count = plan.hop_count();
    for (index, entry) in plan.hops().enumerate() {
        let role = if index + 1 == hop_count {
            Cell::new("target").fg(Color::Green)
        } else {
            Cell::new("proxy")
        };
        table.add_row(vec![
            Cell::new(index + 1),
            role,
            Cell::new(entry.node.display_name()),
            Cell::new(entry.node.host_ref.as_deref().unwrap_or("-")).fg(Color::DarkGrey),
        ]);
    }
    println!("{}", table);

    if !plan.forwards.is_empty() {
        println!("{}", "Forwards:".bold());
        print_forwards_table(&plan);
    }
    println!();
    Ok(())
}

fn print_forwards_table(plan: &HopPlan) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Node", "Kind", "Ports", "Destination"]));

    for forward in &plan.forwards {
        let destination = match (&forward.destination, plan.destination_host(forward)) {
            (_, Some(host)) => host.to_string(),
            (ForwardDestination::AdjacentTarget { host_ref, .. }, None) => {
                format!("<{}>", host_ref)
            }
            (_, None) => "-".to_string(),
        };
        table.add_row(vec![
            Cell::new(forward.node.display_name()),
            Cell::new(forward.node.kind),
            Cell::new(port_summary(&forward.node)),
            Cell::new(destination),
        ]);
    }
    println!("{}", table);
}

async fn compose_profile(
    store: &ProfileStore,
    reference: &str,
    hosts: Option<&Path>,
) -> Result<()> {
    let profile = find_profile(store, reference)?;
    profile.ensure_valid()?;

    let book = load_host_book(hosts)?.addresses_only();
    let plan = resolve_from_local(&profile)?;
    let plan = materialize_credentials(&plan, &book).await?;

    let command = compose(&plan).context("Failed to compose command")?;
    println!("{}", command);
    Ok(())
}

/// Resolve, fetch credentials, then build with a spinner; Ctrl-C cancels the build
async fn build_chain(
    profile: &TunnelProfile,
    hosts: Option<&Path>,
    accept_new: bool,
) -> Result<ConnectionHandle> {
    profile.ensure_valid()?;

    let mut options = profile.options.clone();
    if accept_new {
        options.host_key_policy = HostKeyPolicy::AcceptNew;
    }

    // Prompts happen here, before the spinner takes the terminal
    let book = load_host_book(hosts)?.interactive(true);
    let plan = resolve_from_local(profile)?;
    let plan = materialize_credentials(&plan, &book).await?;

    let connector = RusshConnector::new(&options).context("Failed to load known hosts")?;
    let builder = ChainBuilder::new(Arc::new(connector), options);

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(format!(
        "Connecting to '{}' through {} hop(s)...",
        profile.metadata.name,
        plan.hop_count()
    ));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let cancel = CancellationToken::new();
    let build = builder.build(&plan, &book, cancel.clone());
    tokio::pin!(build);

    let result = tokio::select! {
        result = &mut build => result,
        _ = tokio::signal::ctrl_c() => {
            spinner.set_message("Cancelling...");
            cancel.cancel();
            build.await
        }
    };
    spinner.finish_and_clear();

    let handle = result.context("Failed to build chain")?;
    println!(
        "{} {}",
        "✓ Connected:".green().bold(),
        handle.hops().join(" → ")
    );
    for forward in handle.forwards() {
        println!("  {} {}", "↳".cyan(), forward);
    }
    Ok(handle)
}

async fn connect(
    store: &ProfileStore,
    reference: &str,
    hosts: Option<&Path>,
    accept_new: bool,
) -> Result<()> {
    let profile = find_profile(store, reference)?;
    let handle = build_chain(&profile, hosts, accept_new).await?;

    let outcome = bridge_terminal(&handle).await;
    handle.dispose().await;

    match outcome {
        Ok(Some(reason)) => {
            println!();
            println!("{}", format!("⚠️  Connection lost: {}", reason).yellow());
        }
        Ok(None) => {
            println!();
            println!("{}", "✓ Disconnected".green().bold());
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Copy stdin to the shell and shell output to stdout until the chain drops or Ctrl-C
///
/// Returns the disconnect reason when the chain dropped on its own.
async fn bridge_terminal(handle: &ConnectionHandle) -> Result<Option<String>> {
    let mut output = handle
        .subscribe_output()
        .context("Target shell is not available")?;

    let (lost_tx, mut lost_rx) = tokio::sync::oneshot::channel();
    handle.on_disconnected(move |reason| {
        let _ = lost_tx.send(reason.to_string());
    });

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut input = [0u8; 1024];
    let mut stdin_open = true;

    loop {
        tokio::select! {
            read = stdin.read(&mut input), if stdin_open => match read {
                Ok(0) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Ok(n) => {
                    if !handle.write(&input[..n]).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            chunk = output.recv() => match chunk {
                Ok(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} chunk(s) of shell output", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            reason = &mut lost_rx => {
                return Ok(reason.ok());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(None)
}

async fn exec(
    store: &ProfileStore,
    reference: &str,
    command: &str,
    timeout: Option<u64>,
    hosts: Option<&Path>,
    accept_new: bool,
) -> Result<()> {
    let profile = find_profile(store, reference)?;
    let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| profile.options.command_timeout());

    let handle = build_chain(&profile, hosts, accept_new).await?;
    let output = handle.run_command(command, timeout).await;
    handle.dispose().await;

    match output {
        Some(output) => {
            print!("{}", output);
            Ok(())
        }
        None => bail!("Command '{}' failed or timed out after {:?}", command, timeout),
    }
}

fn list_profiles(store: &ProfileStore, json: bool) -> Result<()> {
    let profiles = store.load_all()?;

    if json {
        let json_output = serde_json::to_string_pretty(&profiles)?;
        println!("{}", json_output);
        return Ok(());
    }

    if profiles.is_empty() {
        println!("{}", "No profiles found.".yellow());
        println!(
            "Import one with: {}",
            "ssh-chain import <file.toml>".cyan()
        );
        return Ok(());
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(header(&["Name", "Hops", "Forwards", "Modified", "Tags"]));

    for profile in &profiles {
        let hops = profile
            .nodes
            .iter()
            .filter(|n| n.kind.is_ssh_capable())
            .count();
        let forwards = profile.nodes.iter().filter(|n| n.kind.is_forward()).count();
        let tags = if profile.metadata.tags.is_empty() {
            "-".to_string()
        } else {
            profile.metadata.tags.join(", ")
        };

        table.add_row(vec![
            Cell::new(&profile.metadata.name).fg(Color::Green),
            Cell::new(hops),
            Cell::new(forwards),
            Cell::new(profile.metadata.modified_at.format("%Y-%m-%d %H:%M")),
            Cell::new(tags).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    println!("{} profile(s) found", profiles.len().to_string().cyan());
    println!();
    Ok(())
}

fn show_profile(store: &ProfileStore, reference: &str) -> Result<()> {
    let profile = find_profile(store, reference)?;

    println!();
    println!("{}", profile.metadata.name.bold().cyan());
    println!("  {} {}", "ID:".bold(), profile.metadata.id);
    if let Some(description) = &profile.metadata.description {
        println!("  {} {}", "Description:".bold(), description);
    }
    println!(
        "  {} {}",
        "Created:".bold(),
        profile.metadata.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!(
        "  {} {}s connect, {}s command, host keys {}",
        "Options:".bold(),
        profile.options.connect_timeout_secs,
        profile.options.command_timeout_secs,
        match profile.options.host_key_policy {
            HostKeyPolicy::Strict => "strict",
            HostKeyPolicy::AcceptNew => "accept-new",
        }
    );

    let mut nodes = Table::new();
    nodes.set_content_arrangement(ContentArrangement::Dynamic);
    nodes.set_header(header(&["ID", "Kind", "Label", "Host ref", "Ports", "Bind"]));
    for node in &profile.nodes {
        let kind = match node.kind {
            NodeKind::LocalMachine => Cell::new(node.kind).fg(Color::DarkGrey),
            NodeKind::TargetHost => Cell::new(node.kind).fg(Color::Green),
            _ => Cell::new(node.kind),
        };
        nodes.add_row(vec![
            Cell::new(&node.id),
            kind,
            Cell::new(if node.label.is_empty() { "-" } else { node.label.as_str() }),
            Cell::new(node.host_ref.as_deref().unwrap_or("-")),
            Cell::new(port_summary(node)),
            Cell::new(node.bind_address.as_deref().unwrap_or("-")),
        ]);
    }
    println!();
    println!("{}", "Nodes:".bold());
    println!("{}", nodes);

    let mut edges = Table::new();
    edges.set_content_arrangement(ContentArrangement::Dynamic);
    edges.set_header(header(&["From", "To"]));
    for edge in &profile.edges {
        edges.add_row(vec![Cell::new(&edge.source), Cell::new(&edge.target)]);
    }
    println!("{}", "Edges:".bold());
    println!("{}", edges);
    println!();
    Ok(())
}

fn import_profile(store: &ProfileStore, file: &Path, force: bool) -> Result<()> {
    let profile = load_profile(file)?;

    let issues = validate(&profile);
    for issue in issues.warnings() {
        println!("  {} {}", "⚠️ ".yellow(), issue.to_string().yellow());
    }
    if issues.has_errors() {
        for issue in issues.errors() {
            println!("  {} {}", "✗".red().bold(), issue.to_string().red());
        }
        bail!("Refusing to import '{}': graph has errors", file.display());
    }

    let path = store.save(&profile, force)?;
    println!(
        "{}",
        format!("✓ Imported '{}'", profile.metadata.name)
            .green()
            .bold()
    );
    println!("  {}", path.display().to_string().dimmed());
    Ok(())
}

fn header(titles: &[&str]) -> Vec<Cell> {
    titles
        .iter()
        .map(|title| {
            Cell::new(title)
                .add_attribute(Attribute::Bold)
                .fg(Color::Cyan)
        })
        .collect()
}

/// Port fields in the order their kind reads them
fn port_summary(node: &TunnelNode) -> String {
    let port = |p: Option<u32>| p.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string());
    match node.kind {
        NodeKind::LocalPortForward => {
            format!("{} → {}", port(node.local_port), port(node.remote_port))
        }
        NodeKind::RemotePortForward => {
            format!("{} → {}", port(node.remote_port), port(node.local_port))
        }
        NodeKind::DynamicProxy => format!("SOCKS {}", port(node.local_port)),
        NodeKind::LocalMachine | NodeKind::SshHost | NodeKind::TargetHost => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from([
            "ssh-chain",
            "exec",
            "prod",
            "uptime",
            "--timeout",
            "5",
            "-vv",
            "--hosts",
            "/tmp/hosts.toml",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.hosts, Some(PathBuf::from("/tmp/hosts.toml")));
        match cli.command {
            Commands::Exec {
                profile,
                command,
                timeout,
                accept_new,
            } => {
                assert_eq!(profile, "prod");
                assert_eq!(command, "uptime");
                assert_eq!(timeout, Some(5));
                assert!(!accept_new);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_connect_accept_new_flag() {
        let cli = Cli::try_parse_from(["ssh-chain", "connect", "prod", "--accept-new"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Connect { accept_new: true, .. }
        ));
    }

    #[test]
    fn test_port_summary() {
        let forward = TunnelNode::local_forward("pg", 5432, 15432);
        assert_eq!(port_summary(&forward), "5432 → 15432");

        let remote = TunnelNode::remote_forward("rf", 9000, 3000);
        assert_eq!(port_summary(&remote), "9000 → 3000");

        let socks = TunnelNode::dynamic_proxy("socks", 1080);
        assert_eq!(port_summary(&socks), "SOCKS 1080");

        assert_eq!(port_summary(&TunnelNode::ssh_host("a", "bastion")), "-");
    }
}
