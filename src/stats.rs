use std::time::{Duration, SystemTime};

/// One timed probe attempt against a resolver.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSample {
	pub elapsed: Duration,
	pub success: bool,
}

impl ProbeSample {
	pub fn ok(elapsed: Duration) -> Self {
		ProbeSample { elapsed, success: true }
	}

	pub fn failed(elapsed: Duration) -> Self {
		ProbeSample { elapsed, success: false }
	}
}

/// Aggregate latency statistics for one resolver test run.
///
/// Invariant: when `success` is false, loss is 100 and all latencies are zero.
#[derive(Debug, Clone)]
pub struct TestResult {
	pub resolver_id: u32,
	pub avg: Duration,
	pub min: Duration,
	pub max: Duration,
	/// Percentage of samples that failed, 0-100.
	pub loss_pct: f32,
	pub success: bool,
	pub sample_count: u32,
	pub timestamp: SystemTime,
}

impl TestResult {
	/// Reduce a run of probe samples to a single result.
	///
	/// Average, min and max are computed over successful samples only.
	/// Zero successes (or zero samples) yields the degraded all-zero result.
	pub fn from_samples(resolver_id: u32, samples: &[ProbeSample]) -> Self {
		let total = samples.len();
		let successes: Vec<Duration> = samples.iter()
			.filter(|s| s.success)
			.map(|s| s.elapsed)
			.collect();

		if successes.is_empty() {
			return TestResult {
				resolver_id,
				avg: Duration::ZERO,
				min: Duration::ZERO,
				max: Duration::ZERO,
				loss_pct: 100.0,
				success: false,
				sample_count: total as u32,
				timestamp: SystemTime::now(),
			};
		}

		let sum: Duration = successes.iter().sum();
		let avg = sum / successes.len() as u32;
		let min = successes.iter().min().copied().unwrap_or(Duration::ZERO);
		let max = successes.iter().max().copied().unwrap_or(Duration::ZERO);
		let loss_pct = ((total - successes.len()) as f32 / total as f32) * 100.0;

		TestResult {
			resolver_id,
			avg,
			min,
			max,
			loss_pct,
			success: true,
			sample_count: total as u32,
			timestamp: SystemTime::now(),
		}
	}

	pub fn avg_ms(&self) -> u64 {
		self.avg.as_millis() as u64
	}

	/// Quality rating based on average latency.
	pub fn quality(&self) -> Quality {
		if !self.success {
			return Quality::Failed;
		}
		match self.avg_ms() {
			0..=19 => Quality::Excellent,
			20..=49 => Quality::Good,
			50..=99 => Quality::Fair,
			100..=199 => Quality::Poor,
			_ => Quality::VeryPoor,
		}
	}

	/// Stability score 0-100 derived from the min/max latency spread.
	pub fn stability_score(&self) -> u8 {
		if !self.success {
			return 0;
		}
		let spread = (self.max - self.min).as_millis();
		match spread {
			0..=9 => 100,
			10..=29 => 80,
			30..=49 => 60,
			50..=99 => 40,
			_ => 20,
		}
	}
}

/// Latency quality bands for gaming use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
	Excellent,
	Good,
	Fair,
	Poor,
	VeryPoor,
	Failed,
}

impl Quality {
	pub fn label(&self) -> &'static str {
		match self {
			Quality::Excellent => "excellent",
			Quality::Good => "good",
			Quality::Fair => "fair",
			Quality::Poor => "poor",
			Quality::VeryPoor => "very poor",
			Quality::Failed => "failed",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ms(v: u64) -> Duration {
		Duration::from_millis(v)
	}

	#[test]
	fn test_all_successful_samples() {
		let samples = vec![
			ProbeSample::ok(ms(10)),
			ProbeSample::ok(ms(12)),
			ProbeSample::ok(ms(11)),
		];
		let result = TestResult::from_samples(2, &samples);
		assert!(result.success);
		assert_eq!(result.avg, ms(11));
		assert_eq!(result.min, ms(10));
		assert_eq!(result.max, ms(12));
		assert_eq!(result.loss_pct, 0.0);
		assert_eq!(result.sample_count, 3);
	}

	#[test]
	fn test_loss_is_exact_failure_fraction() {
		// loss + 100 * successes / N must equal 100 for any mix
		for failures in 0..=5usize {
			let mut samples = vec![ProbeSample::ok(ms(20)); 5 - failures];
			samples.extend(vec![ProbeSample::failed(ms(5000)); failures]);
			let result = TestResult::from_samples(1, &samples);
			let successes = (5 - failures) as f32;
			let sum = result.loss_pct + 100.0 * successes / 5.0;
			assert!((sum - 100.0).abs() < 1e-4, "failures={}: {}", failures, sum);
		}
	}

	#[test]
	fn test_all_failed_samples() {
		let samples = vec![ProbeSample::failed(ms(5000)); 4];
		let result = TestResult::from_samples(7, &samples);
		assert!(!result.success);
		assert_eq!(result.loss_pct, 100.0);
		assert_eq!(result.avg, Duration::ZERO);
		assert_eq!(result.min, Duration::ZERO);
		assert_eq!(result.max, Duration::ZERO);
		assert_eq!(result.quality(), Quality::Failed);
		assert_eq!(result.stability_score(), 0);
	}

	#[test]
	fn test_empty_samples_degrade_to_failure() {
		let result = TestResult::from_samples(1, &[]);
		assert!(!result.success);
		assert_eq!(result.loss_pct, 100.0);
		assert_eq!(result.sample_count, 0);
	}

	#[test]
	fn test_failed_samples_excluded_from_latencies() {
		let samples = vec![
			ProbeSample::ok(ms(30)),
			ProbeSample::failed(ms(5000)),
			ProbeSample::ok(ms(40)),
		];
		let result = TestResult::from_samples(1, &samples);
		assert!(result.success);
		assert_eq!(result.avg, ms(35));
		assert_eq!(result.max, ms(40));
		assert!((result.loss_pct - 33.333).abs() < 0.01);
	}

	#[test]
	fn test_quality_bands() {
		let fast = TestResult::from_samples(1, &[ProbeSample::ok(ms(12))]);
		assert_eq!(fast.quality(), Quality::Excellent);
		let good = TestResult::from_samples(1, &[ProbeSample::ok(ms(35))]);
		assert_eq!(good.quality(), Quality::Good);
		let slow = TestResult::from_samples(1, &[ProbeSample::ok(ms(250))]);
		assert_eq!(slow.quality(), Quality::VeryPoor);
	}

	#[test]
	fn test_stability_from_spread() {
		let steady = TestResult::from_samples(1, &[
			ProbeSample::ok(ms(20)),
			ProbeSample::ok(ms(24)),
		]);
		assert_eq!(steady.stability_score(), 100);

		let jittery = TestResult::from_samples(1, &[
			ProbeSample::ok(ms(20)),
			ProbeSample::ok(ms(180)),
		]);
		assert_eq!(jittery.stability_score(), 20);
	}
}
