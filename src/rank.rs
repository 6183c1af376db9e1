use std::time::Duration;

use crate::catalog::Resolver;
use crate::probe::{self, ProbeConfig};
use crate::stats::TestResult;

/// Pause between resolvers so the previous probe's sockets fully close
/// before the next measurement starts.
const INTER_RESOLVER_PAUSE: Duration = Duration::from_millis(200);

/// Progress notifications emitted while a ranking run walks the catalog.
pub enum RankEvent<'a> {
	/// The resolver with this id is about to be probed.
	Testing(u32),
	/// The resolver finished with this result.
	Tested(u32, &'a TestResult),
}

/// Probe every resolver sequentially and select the best by average latency.
///
/// Resolvers are probed strictly in input order, one at a time; concurrent
/// probing would skew the measurements through socket contention. Returns
/// None when no resolver produced a successful result.
pub async fn rank_best(
	resolvers: &[Resolver],
	config: &ProbeConfig,
	mut progress: impl FnMut(RankEvent<'_>),
) -> Option<(Resolver, TestResult)> {
	let mut results = Vec::with_capacity(resolvers.len());

	for (i, resolver) in resolvers.iter().enumerate() {
		progress(RankEvent::Testing(resolver.id));

		let result = probe::probe(resolver.id, resolver.primary_socket(), config).await;
		log::info!(
			"tested {} ({}): avg {} ms, loss {:.0}%",
			resolver.name, resolver.primary, result.avg_ms(), result.loss_pct,
		);

		progress(RankEvent::Tested(resolver.id, &result));
		results.push((resolver.clone(), result));

		if i + 1 < resolvers.len() {
			tokio::time::sleep(INTER_RESOLVER_PAUSE).await;
		}
	}

	select_best(results)
}

/// Pick the successful result with the lowest average latency.
///
/// Ties keep the first resolver seen, preserving input order.
pub fn select_best(results: Vec<(Resolver, TestResult)>) -> Option<(Resolver, TestResult)> {
	let mut best: Option<(Resolver, TestResult)> = None;
	for (resolver, result) in results {
		if !result.success {
			continue;
		}
		match &best {
			Some((_, current)) if result.avg >= current.avg => {}
			_ => best = Some((resolver, result)),
		}
	}
	best
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog::{Resolver, ResolverCategory};
	use crate::stats::ProbeSample;

	fn resolver(id: u32, primary: &str) -> Resolver {
		Resolver {
			id,
			name: format!("resolver-{}", id),
			primary: primary.parse().unwrap(),
			secondary: primary.parse().unwrap(),
			category: ResolverCategory::Global,
			last_result: None,
		}
	}

	fn result_from_ms(id: u32, latencies_ms: &[u64]) -> TestResult {
		let samples: Vec<ProbeSample> = latencies_ms.iter()
			.map(|&ms| ProbeSample::ok(Duration::from_millis(ms)))
			.collect();
		TestResult::from_samples(id, &samples)
	}

	fn failed_result(id: u32) -> TestResult {
		TestResult::from_samples(id, &[ProbeSample::failed(Duration::from_millis(5000))])
	}

	#[test]
	fn test_select_best_empty() {
		assert!(select_best(Vec::new()).is_none());
	}

	#[test]
	fn test_select_best_all_failed() {
		let results = vec![
			(resolver(1, "8.8.8.8"), failed_result(1)),
			(resolver(2, "1.1.1.1"), failed_result(2)),
		];
		assert!(select_best(results).is_none());
	}

	#[test]
	fn test_single_success_wins_regardless_of_latency() {
		let results = vec![
			(resolver(1, "8.8.8.8"), failed_result(1)),
			(resolver(2, "1.1.1.1"), result_from_ms(2, &[900])),
			(resolver(3, "9.9.9.9"), failed_result(3)),
		];
		let (winner, result) = select_best(results).unwrap();
		assert_eq!(winner.id, 2);
		assert!(result.success);
	}

	#[test]
	fn test_lowest_average_wins() {
		let results = vec![
			(resolver(1, "8.8.8.8"), result_from_ms(1, &[30, 32, 31])),
			(resolver(2, "1.1.1.1"), result_from_ms(2, &[10, 12, 11])),
		];
		let (winner, result) = select_best(results).unwrap();
		assert_eq!(winner.id, 2);
		assert_eq!(result.avg, Duration::from_millis(11));
	}

	#[test]
	fn test_tie_keeps_input_order() {
		let results = vec![
			(resolver(5, "8.8.8.8"), result_from_ms(5, &[20, 20])),
			(resolver(6, "1.1.1.1"), result_from_ms(6, &[20, 20])),
		];
		let (winner, _) = select_best(results).unwrap();
		assert_eq!(winner.id, 5);
	}

	#[tokio::test]
	async fn test_rank_best_empty_catalog() {
		let config = ProbeConfig::gaming();
		let best = rank_best(&[], &config, |_| {}).await;
		assert!(best.is_none());
	}

	#[tokio::test]
	async fn test_rank_events_follow_input_order() {
		// Unreachable addresses with a tiny budget: we only care about
		// the event sequence here.
		let resolvers = vec![resolver(1, "192.0.2.1"), resolver(2, "192.0.2.2")];
		let config = ProbeConfig {
			timeout: Duration::from_millis(30),
			samples: 1,
			sample_delay: Duration::from_millis(1),
			method: crate::probe::Method::TcpConnect,
			..ProbeConfig::default()
		};

		let mut order = Vec::new();
		let best = rank_best(&resolvers, &config, |event| {
			match event {
				RankEvent::Testing(id) => order.push((id, false)),
				RankEvent::Tested(id, _) => order.push((id, true)),
			}
		}).await;

		assert!(best.is_none());
		assert_eq!(order, vec![(1, false), (1, true), (2, false), (2, true)]);
	}
}
