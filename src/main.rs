mod catalog;
mod cli;
mod controller;
mod dns;
mod output;
mod probe;
mod provider;
mod rank;
mod stats;
mod tunnel;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::cli::{Cli, Command, ProbeArgs};
use crate::controller::{ConnectionState, SessionController};
use crate::probe::{Method, ProbeConfig};
use crate::provider::LoopbackProvider;

fn probe_config(args: &ProbeArgs) -> ProbeConfig {
	let mut config = if args.gaming {
		ProbeConfig::gaming()
	} else {
		ProbeConfig::default()
	};
	if let Some(domain) = &args.domain {
		config.domain = domain.clone();
	}
	if let Some(samples) = args.samples {
		config.samples = samples;
	}
	if let Some(timeout) = args.timeout {
		config.timeout = Duration::from_millis(timeout);
	}
	if args.tcp {
		config.method = Method::TcpConnect;
	}
	config
}

#[tokio::main]
async fn main() -> Result<()> {
	env_logger::Builder::from_env(
		env_logger::Env::default().default_filter_or("info"),
	).init();

	let cli = Cli::parse();

	// Collect the catalog: predefined servers, then user additions
	let mut resolvers = catalog::predefined();
	if let Some(path) = &cli.resolver_file {
		resolvers.extend(catalog::read_resolver_file(path, catalog::CUSTOM_ID_BASE)?);
	}

	let provider = Arc::new(LoopbackProvider::new());
	let controller = Arc::new(SessionController::new(
		Arc::clone(&provider) as Arc<dyn provider::TunnelProvider>,
		resolvers,
	));
	for input in &cli.resolvers {
		controller.add_custom(input)?;
	}

	match &cli.command {
		Command::List => {
			output::print_catalog(&controller.resolvers());
		}

		Command::Test { id, probe, output: csv_path } => {
			let config = probe_config(probe);
			let ids: Vec<u32> = match id {
				Some(one) => vec![*one],
				None => controller.resolvers().iter().map(|r| r.id).collect(),
			};

			for (i, rid) in ids.iter().enumerate() {
				let result = controller.request_test(*rid, &config).await?;
				let name = controller.resolvers().iter()
					.find(|r| r.id == *rid)
					.map(|r| r.name.clone())
					.unwrap_or_default();
				if result.success {
					println!("  {}: {} ms avg, {:.0}% loss", name, result.avg_ms(), result.loss_pct);
				} else {
					println!("  {}: failed", name);
				}
				// Let the previous probe's sockets drain before the next resolver
				if i + 1 < ids.len() {
					tokio::time::sleep(Duration::from_millis(200)).await;
				}
			}

			println!();
			output::print_results(&controller.resolvers(), None);
			if let Some(path) = csv_path {
				output::write_csv(path, &controller.resolvers())?;
			}
		}

		Command::Best { probe, output: csv_path } => {
			let config = probe_config(probe);
			let best = find_best_with_progress(&controller, &config).await?;

			println!();
			let selected = *controller.selected().borrow();
			output::print_results(&controller.resolvers(), selected);
			match best {
				Some((id, result)) => {
					let name = controller.resolvers().iter()
						.find(|r| r.id == id)
						.map(|r| r.name.clone())
						.unwrap_or_default();
					println!("\nBest resolver: {} ({} ms avg). Connect with: gamedns connect --id {}",
						name, result.avg_ms(), id);
				}
				None => println!("\nNo resolver produced a successful test."),
			}
			if let Some(path) = csv_path {
				output::write_csv(path, &controller.resolvers())?;
			}
		}

		Command::Connect { id, best, probe } => {
			let target = if *best {
				let config = probe_config(probe);
				match find_best_with_progress(&controller, &config).await? {
					Some((id, _)) => id,
					None => bail!("no resolver produced a successful test"),
				}
			} else {
				(*id).context("pass --id <N> or --best")?
			};

			run_connected(&controller, &provider, target).await?;
		}
	}

	Ok(())
}

/// Rank the catalog while echoing per-resolver progress from the
/// controller's testing observable.
async fn find_best_with_progress(
	controller: &Arc<SessionController>,
	config: &ProbeConfig,
) -> Result<Option<(u32, stats::TestResult)>> {
	let names: std::collections::HashMap<u32, String> = controller.resolvers()
		.iter()
		.map(|r| (r.id, r.name.clone()))
		.collect();

	let mut testing_rx = controller.testing();
	let watcher = tokio::spawn(async move {
		while testing_rx.changed().await.is_ok() {
			let current = *testing_rx.borrow();
			if let Some(id) = current {
				let name = names.get(&id).cloned().unwrap_or_else(|| id.to_string());
				println!("  testing {}...", name);
			}
		}
	});

	let best = controller.request_find_best(config).await;
	watcher.abort();
	Ok(best?)
}

/// Hold the tunnel open, printing stats every few seconds until ctrl-c.
async fn run_connected(
	controller: &Arc<SessionController>,
	provider: &LoopbackProvider,
	id: u32,
) -> Result<()> {
	// Log observable transitions the way a UI would render them
	let mut state_rx = controller.state();
	let state_watcher = tokio::spawn(async move {
		while state_rx.changed().await.is_ok() {
			let label = state_rx.borrow().label();
			println!("state: {}", label);
		}
	});

	controller.request_connect(id).await?;
	if let Some(text) = provider.indicator() {
		println!("{}", text);
	}

	// SIGHUP stands in for the platform withdrawing the tunnel grant
	let mut revoked = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				println!("\ninterrupted, disconnecting");
				break;
			}
			_ = revoked.recv() => {
				println!("\ntunnel grant revoked");
				controller.on_revoked().await;
				state_watcher.abort();
				return Ok(());
			}
			_ = tokio::time::sleep(Duration::from_secs(3)) => {
				controller.refresh_stats().await;
				if let ConnectionState::Connected(stats) = controller.current_state() {
					println!(
						"  {} | up {} | latency {} ms | {} relayed",
						stats.resolver_name,
						stats.formatted_uptime(),
						if stats.latency_ms > 0 { stats.latency_ms.to_string() } else { "-".to_string() },
						stats.formatted_bytes(),
					);
				}
			}
		}
	}

	controller.request_disconnect().await;
	state_watcher.abort();
	Ok(())
}
