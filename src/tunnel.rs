use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use thiserror::Error;

use crate::catalog::Resolver;
use crate::probe;
use crate::provider::{TunnelConfig, TunnelHandle, TunnelProvider};

/// Poll granularity of the packet-relay loop; teardown is observable within
/// roughly one poll.
const RELAY_POLL: Duration = Duration::from_millis(1);

/// Read buffer comfortably above the interface MTU.
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Timeout for the monitor's per-tick latency measurement.
const MONITOR_TIMEOUT: Duration = Duration::from_millis(1500);

const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TunnelError {
	#[error("failed to establish tunnel: {0}")]
	Establish(String),
}

/// Lifecycle states of the single tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
	Idle,
	Establishing,
	Active,
	TearingDown,
	/// A denied or failed establish. Recoverable: the next establish or an
	/// explicit teardown returns to Idle.
	Failed,
}

/// Counters shared between the relay thread, the monitor task and readers.
#[derive(Debug, Default)]
pub struct TunnelStats {
	pub bytes_relayed: AtomicU64,
	/// Last measured round trip to the bound resolver, 0 until known.
	pub latency_ms: AtomicU64,
}

/// Read-only projection of the live session for observers.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
	pub resolver_id: u32,
	pub resolver_name: String,
	pub started_at: SystemTime,
	pub uptime: Duration,
	pub latency_ms: u64,
	pub bytes_relayed: u64,
}

struct ActiveTunnel {
	resolver: Resolver,
	handle: Arc<dyn TunnelHandle>,
	stats: Arc<TunnelStats>,
	stop: Arc<AtomicBool>,
	relay: Option<thread::JoinHandle<()>>,
	monitor: tokio::task::JoinHandle<()>,
	started_at: SystemTime,
	started_instant: Instant,
}

/// Owns the lifecycle of the process's one local VPN interface.
///
/// At most one tunnel is ever active: establish tears down any running
/// session before asking the provider for a new interface.
pub struct TunnelSession {
	provider: Arc<dyn TunnelProvider>,
	monitor_interval: Duration,
	state: TunnelState,
	active: Option<ActiveTunnel>,
}

impl TunnelSession {
	pub fn new(provider: Arc<dyn TunnelProvider>) -> Self {
		TunnelSession {
			provider,
			monitor_interval: DEFAULT_MONITOR_INTERVAL,
			state: TunnelState::Idle,
			active: None,
		}
	}

	#[cfg(test)]
	pub fn with_monitor_interval(provider: Arc<dyn TunnelProvider>, interval: Duration) -> Self {
		let mut session = Self::new(provider);
		session.monitor_interval = interval;
		session
	}

	pub fn state(&self) -> TunnelState {
		self.state
	}

	pub fn is_active(&self) -> bool {
		self.active.is_some()
	}

	/// Run the platform's permission step, if any.
	pub fn prepare(&self) -> Result<(), TunnelError> {
		self.provider.prepare()
	}

	/// Bring up the interface bound to the resolver's DNS pair.
	///
	/// Tears down any active session first, then starts the relay thread
	/// and the periodic stats monitor. A provider denial leaves the session
	/// in Failed with no retry.
	pub fn establish(&mut self, resolver: &Resolver) -> Result<(), TunnelError> {
		if self.active.is_some() {
			log::info!("tunnel already active, tearing down before reconnect");
			self.teardown();
		}

		self.state = TunnelState::Establishing;
		let config = TunnelConfig::for_resolver(resolver);

		let handle = match self.provider.establish(&config) {
			Ok(h) => h,
			Err(e) => {
				log::error!("establish failed: {}", e);
				self.state = TunnelState::Failed;
				return Err(e);
			}
		};
		let handle: Arc<dyn TunnelHandle> = Arc::from(handle);

		let stats = Arc::new(TunnelStats::default());
		let stop = Arc::new(AtomicBool::new(false));

		let relay = {
			let relay_handle = Arc::clone(&handle);
			let stats = Arc::clone(&stats);
			let stop = Arc::clone(&stop);
			match thread::Builder::new()
				.name("gamedns-relay".to_string())
				.spawn(move || relay_loop(relay_handle, stats, stop))
			{
				Ok(join) => join,
				Err(e) => {
					handle.close();
					self.state = TunnelState::Failed;
					return Err(TunnelError::Establish(format!("failed to spawn relay thread: {}", e)));
				}
			}
		};

		let monitor = tokio::spawn(monitor_loop(
			resolver.primary_socket(),
			self.monitor_interval,
			Arc::clone(&stats),
			Arc::clone(&stop),
		));

		self.provider.show_indicator(&format!("Connected to {}", resolver.name));

		self.active = Some(ActiveTunnel {
			resolver: resolver.clone(),
			handle,
			stats,
			stop,
			relay: Some(relay),
			monitor,
			started_at: SystemTime::now(),
			started_instant: Instant::now(),
		});
		self.state = TunnelState::Active;
		log::info!(
			"tunnel active: {} (dns {} / {})",
			resolver.name, resolver.primary, resolver.secondary,
		);
		Ok(())
	}

	/// Stop the relay thread and monitor, close the interface and clear the
	/// indicator. Idempotent; internal errors are logged, never raised.
	pub fn teardown(&mut self) {
		let Some(mut active) = self.active.take() else {
			// Also normalizes a Failed session back to Idle
			self.state = TunnelState::Idle;
			return;
		};

		self.state = TunnelState::TearingDown;
		active.stop.store(true, Ordering::SeqCst);

		if let Some(relay) = active.relay.take() {
			if relay.join().is_err() {
				log::warn!("relay thread panicked during teardown");
			}
		}
		active.monitor.abort();
		active.handle.close();
		self.provider.clear_indicator();

		self.state = TunnelState::Idle;
		log::info!("tunnel torn down ({})", active.resolver.name);
	}

	/// Live stats for the active session, or None when not connected.
	pub fn snapshot(&self) -> Option<SessionSnapshot> {
		let active = self.active.as_ref()?;
		Some(SessionSnapshot {
			resolver_id: active.resolver.id,
			resolver_name: active.resolver.name.clone(),
			started_at: active.started_at,
			uptime: active.started_instant.elapsed(),
			latency_ms: active.stats.latency_ms.load(Ordering::Relaxed),
			bytes_relayed: active.stats.bytes_relayed.load(Ordering::Relaxed),
		})
	}
}

impl Drop for TunnelSession {
	fn drop(&mut self) {
		if let Some(active) = self.active.take() {
			active.stop.store(true, Ordering::SeqCst);
			active.monitor.abort();
			active.handle.close();
			self.provider.clear_indicator();
		}
	}
}

/// Blocking packet loop on its own thread.
///
/// Reads are counted, not parsed or forwarded: the interface itself pins
/// DNS to the bound resolver, so the payload needs no handling here.
fn relay_loop(handle: Arc<dyn TunnelHandle>, stats: Arc<TunnelStats>, stop: Arc<AtomicBool>) {
	let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
	log::debug!("relay loop started");

	while !stop.load(Ordering::Relaxed) {
		match handle.read_packet(&mut buf, RELAY_POLL) {
			Ok(0) => continue,
			Ok(n) => {
				stats.bytes_relayed.fetch_add(n as u64, Ordering::Relaxed);
			}
			Err(e) => {
				if !stop.load(Ordering::Relaxed) {
					log::warn!("relay read error: {}", e);
				}
				break;
			}
		}
	}

	log::debug!("relay loop stopped");
}

/// Periodic latency refresh while the session is active.
async fn monitor_loop(
	resolver_addr: std::net::SocketAddr,
	interval: Duration,
	stats: Arc<TunnelStats>,
	stop: Arc<AtomicBool>,
) {
	while !stop.load(Ordering::Relaxed) {
		tokio::time::sleep(interval).await;
		if stop.load(Ordering::Relaxed) {
			break;
		}
		if let Some(rtt) = probe::measure_once(resolver_addr, MONITOR_TIMEOUT).await {
			stats.latency_ms.store(rtt.as_millis() as u64, Ordering::Relaxed);
		}
	}
	log::debug!("monitor loop stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::catalog;
	use crate::provider::LoopbackProvider;

	fn session_with_provider() -> (Arc<LoopbackProvider>, TunnelSession) {
		let provider = Arc::new(LoopbackProvider::new());
		let session = TunnelSession::with_monitor_interval(
			Arc::clone(&provider) as Arc<dyn TunnelProvider>,
			Duration::from_secs(60),
		);
		(provider, session)
	}

	#[tokio::test]
	async fn test_establish_and_teardown() {
		let (provider, mut session) = session_with_provider();
		let servers = catalog::predefined();

		assert_eq!(session.state(), TunnelState::Idle);
		session.establish(&servers[0]).unwrap();
		assert_eq!(session.state(), TunnelState::Active);
		assert!(session.is_active());
		assert_eq!(provider.open_handles(), 1);
		assert!(provider.indicator().unwrap().contains(&servers[0].name));

		session.teardown();
		assert_eq!(session.state(), TunnelState::Idle);
		assert!(!session.is_active());
		assert_eq!(provider.open_handles(), 0);
		assert!(provider.indicator().is_none());
	}

	#[tokio::test]
	async fn test_teardown_is_idempotent() {
		let (provider, mut session) = session_with_provider();
		let servers = catalog::predefined();

		session.establish(&servers[0]).unwrap();
		session.teardown();
		let state_after_first = session.state();
		session.teardown();
		assert_eq!(session.state(), state_after_first);
		assert_eq!(provider.open_handles(), 0);

		// Teardown from Idle with no prior session is a no-op too
		let (_, mut fresh) = session_with_provider();
		fresh.teardown();
		assert_eq!(fresh.state(), TunnelState::Idle);
	}

	#[tokio::test]
	async fn test_reconnect_replaces_single_active_tunnel() {
		let (provider, mut session) = session_with_provider();
		let servers = catalog::predefined();

		session.establish(&servers[0]).unwrap();
		session.establish(&servers[1]).unwrap();

		// Exactly one interface open, bound to the second resolver
		assert_eq!(provider.open_handles(), 1);
		let snapshot = session.snapshot().unwrap();
		assert_eq!(snapshot.resolver_id, servers[1].id);
		assert!(provider.indicator().unwrap().contains(&servers[1].name));

		session.teardown();
		assert_eq!(provider.open_handles(), 0);
	}

	#[tokio::test]
	async fn test_denied_establish_then_recovery() {
		let (provider, mut session) = session_with_provider();
		let servers = catalog::predefined();

		provider.deny_next();
		let err = session.establish(&servers[0]).unwrap_err();
		assert!(matches!(err, TunnelError::Establish(_)));
		assert_eq!(session.state(), TunnelState::Failed);
		assert!(!session.is_active());
		assert_eq!(provider.open_handles(), 0);

		// A subsequent establish with the grant in place succeeds
		session.establish(&servers[0]).unwrap();
		assert_eq!(session.state(), TunnelState::Active);
		session.teardown();
	}

	#[tokio::test]
	async fn test_relay_counts_bytes() {
		let (provider, mut session) = session_with_provider();
		let servers = catalog::predefined();
		session.establish(&servers[0]).unwrap();

		assert!(provider.inject(vec![0u8; 100]));
		assert!(provider.inject(vec![0u8; 28]));

		// Give the relay thread a few polls to drain the feed
		let deadline = Instant::now() + Duration::from_secs(2);
		loop {
			let bytes = session.snapshot().unwrap().bytes_relayed;
			if bytes >= 128 {
				break;
			}
			assert!(Instant::now() < deadline, "relay did not count bytes in time");
			tokio::time::sleep(Duration::from_millis(10)).await;
		}

		session.teardown();
	}

	#[tokio::test]
	async fn test_snapshot_absent_when_idle() {
		let (_, session) = session_with_provider();
		assert!(session.snapshot().is_none());
	}
}
