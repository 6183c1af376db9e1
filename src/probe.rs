use std::net::SocketAddr;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use tokio::net::{TcpStream, UdpSocket};

use crate::dns::{build_query, parse_response};
use crate::stats::{ProbeSample, TestResult};

/// How an individual latency sample is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	/// Time a full DNS A resolution against the resolver.
	Resolve,
	/// Raw reachability: time a TCP connect to port 53.
	TcpConnect,
}

/// Configuration for one resolver test run.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
	pub domain: String,
	pub timeout: Duration,
	pub samples: u32,
	pub sample_delay: Duration,
	pub method: Method,
}

impl Default for ProbeConfig {
	fn default() -> Self {
		ProbeConfig {
			domain: "www.google.com".to_string(),
			timeout: Duration::from_millis(5000),
			samples: 5,
			sample_delay: Duration::from_millis(100),
			method: Method::Resolve,
		}
	}
}

impl ProbeConfig {
	/// Gaming preset: fewer samples and tighter timeouts to minimize total
	/// probing time at some cost to statistical confidence.
	pub fn gaming() -> Self {
		ProbeConfig {
			timeout: Duration::from_millis(3000),
			samples: 3,
			sample_delay: Duration::from_millis(50),
			..ProbeConfig::default()
		}
	}
}

/// Run a full test against one resolver address.
///
/// Performs `samples` sequential timed attempts with `sample_delay` between
/// them (not after the last). Individual failures are absorbed into the loss
/// statistic; this function never errors, it returns a degraded result when
/// every attempt fails.
pub async fn probe(resolver_id: u32, addr: SocketAddr, config: &ProbeConfig) -> TestResult {
	let mut samples = Vec::with_capacity(config.samples as usize);

	for i in 0..config.samples {
		let sample = match config.method {
			Method::Resolve => resolve_once(addr, &config.domain, config.timeout).await,
			Method::TcpConnect => connect_once(addr, config.timeout).await,
		};
		log::debug!(
			"probe {} sample {}/{}: {:?} ({})",
			addr.ip(), i + 1, config.samples, sample.elapsed,
			if sample.success { "ok" } else { "failed" },
		);
		samples.push(sample);

		if i + 1 < config.samples {
			tokio::time::sleep(config.sample_delay).await;
		}
	}

	TestResult::from_samples(resolver_id, &samples)
}

/// Single round-trip measurement used by the tunnel monitor loop.
///
/// Returns the TCP connect time to port 53, or None on timeout/error.
pub async fn measure_once(addr: SocketAddr, timeout: Duration) -> Option<Duration> {
	let start = Instant::now();
	match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
		Ok(Ok(_stream)) => Some(start.elapsed()),
		_ => None,
	}
}

async fn connect_once(addr: SocketAddr, timeout: Duration) -> ProbeSample {
	match measure_once(addr, timeout).await {
		Some(elapsed) => ProbeSample::ok(elapsed),
		None => ProbeSample::failed(timeout),
	}
}

/// Time a single DNS resolution over UDP.
///
/// Binds a dedicated socket per attempt to avoid response stealing between
/// back-to-back samples; retries the recv on txid mismatch within the
/// remaining timeout budget.
async fn resolve_once(addr: SocketAddr, domain: &str, timeout: Duration) -> ProbeSample {
	let txid: u16 = rand::random();
	let query_bytes = match build_query(domain, txid) {
		Ok(bytes) => bytes,
		Err(_) => return ProbeSample::failed(Duration::ZERO),
	};

	let bind_addr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
	let socket = match UdpSocket::bind(bind_addr).await {
		Ok(s) => s,
		Err(_) => return ProbeSample::failed(Duration::ZERO),
	};

	let start = Instant::now();
	if socket.send_to(&query_bytes, addr).await.is_err() {
		return ProbeSample::failed(start.elapsed());
	}

	// 4096-byte buffer to handle EDNS-extended responses
	let mut buf = vec![0u8; 4096];
	let max_retries = 3;
	for _ in 0..max_retries {
		let elapsed = start.elapsed();
		if elapsed >= timeout {
			break;
		}
		let remaining = timeout - elapsed;

		match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
			Ok(Ok((len, _src))) => {
				let elapsed = start.elapsed();
				match parse_response(&buf[..len], txid) {
					Ok(ResponseCode::NoError) => return ProbeSample::ok(elapsed),
					Ok(_) => return ProbeSample::failed(elapsed),
					// txid mismatch or parse error, retry recv
					Err(_) => continue,
				}
			}
			// Timeout or recv error
			_ => break,
		}
	}

	ProbeSample::failed(start.elapsed())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_gaming_preset() {
		let config = ProbeConfig::gaming();
		assert_eq!(config.samples, 3);
		assert_eq!(config.timeout, Duration::from_millis(3000));
		assert_eq!(config.sample_delay, Duration::from_millis(50));
		assert_eq!(config.method, Method::Resolve);
	}

	#[test]
	fn test_default_config() {
		let config = ProbeConfig::default();
		assert_eq!(config.samples, 5);
		assert_eq!(config.timeout, Duration::from_millis(5000));
		assert_eq!(config.domain, "www.google.com");
	}

	#[tokio::test]
	async fn test_probe_unreachable_degrades() {
		// TEST-NET-1 address, nothing listens there; keep the budget tiny
		let addr: SocketAddr = "192.0.2.1:53".parse().unwrap();
		let config = ProbeConfig {
			timeout: Duration::from_millis(50),
			samples: 2,
			sample_delay: Duration::from_millis(1),
			method: Method::TcpConnect,
			..ProbeConfig::default()
		};
		let result = probe(9, addr, &config).await;
		assert!(!result.success);
		assert_eq!(result.loss_pct, 100.0);
		assert_eq!(result.sample_count, 2);
		assert_eq!(result.resolver_id, 9);
	}

	#[tokio::test]
	async fn test_measure_once_timeout() {
		let addr: SocketAddr = "192.0.2.1:53".parse().unwrap();
		let rtt = measure_once(addr, Duration::from_millis(50)).await;
		assert!(rtt.is_none());
	}
}
