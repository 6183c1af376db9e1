use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{watch, Mutex};

use crate::catalog::{self, Resolver, ResolverCategory, CUSTOM_ID_BASE};
use crate::probe::ProbeConfig;
use crate::rank::{self, RankEvent};
use crate::stats::TestResult;
use crate::tunnel::{TunnelError, TunnelSession};

#[derive(Debug, Error)]
pub enum ControllerError {
	#[error("another operation is already in progress")]
	Busy,
	#[error("no resolver with id {0}")]
	UnknownResolver(u32),
	#[error("resolver {0} is not a custom entry and cannot be removed")]
	NotRemovable(u32),
	#[error(transparent)]
	Tunnel(#[from] TunnelError),
}

/// Externally observed projection of the tunnel session.
#[derive(Debug, Clone)]
pub enum ConnectionState {
	Disconnected,
	Connecting,
	Connected(ConnectionStats),
	Error(String),
}

impl ConnectionState {
	pub fn label(&self) -> &'static str {
		match self {
			ConnectionState::Disconnected => "disconnected",
			ConnectionState::Connecting => "connecting",
			ConnectionState::Connected(_) => "connected",
			ConnectionState::Error(_) => "error",
		}
	}

	pub fn is_connected(&self) -> bool {
		matches!(self, ConnectionState::Connected(_))
	}
}

/// Live statistics carried inside the Connected state.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
	pub resolver_id: u32,
	pub resolver_name: String,
	pub connected_at: SystemTime,
	pub uptime: Duration,
	pub latency_ms: u64,
	pub bytes_relayed: u64,
}

impl ConnectionStats {
	pub fn formatted_uptime(&self) -> String {
		let total = self.uptime.as_secs();
		let (hours, minutes, seconds) = (total / 3600, (total / 60) % 60, total % 60);
		if hours > 0 {
			format!("{}h {}m", hours, minutes)
		} else if minutes > 0 {
			format!("{}m {}s", minutes, seconds)
		} else {
			format!("{}s", seconds)
		}
	}

	pub fn formatted_bytes(&self) -> String {
		const KIB: u64 = 1024;
		const MIB: u64 = 1024 * KIB;
		const GIB: u64 = 1024 * MIB;
		match self.bytes_relayed {
			b if b < KIB => format!("{} B", b),
			b if b < MIB => format!("{} KiB", b / KIB),
			b if b < GIB => format!("{} MiB", b / MIB),
			b => format!("{} GiB", b / GIB),
		}
	}
}

/// Orchestrates user intent against the tunnel session and the ranker.
///
/// All mutation goes through the request methods; observers read the watch
/// channels. Only one connect or find-best operation may be in flight.
pub struct SessionController {
	session: Mutex<TunnelSession>,
	catalog: RwLock<Vec<Resolver>>,
	state_tx: watch::Sender<ConnectionState>,
	testing_tx: watch::Sender<Option<u32>>,
	selected_tx: watch::Sender<Option<u32>>,
	busy: AtomicBool,
	prepared: AtomicBool,
	next_custom_id: AtomicU32,
}

impl SessionController {
	pub fn new(provider: Arc<dyn crate::provider::TunnelProvider>, resolvers: Vec<Resolver>) -> Self {
		let next_custom_id = resolvers.iter()
			.map(|r| r.id + 1)
			.max()
			.unwrap_or(0)
			.max(CUSTOM_ID_BASE);
		let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
		let (testing_tx, _) = watch::channel(None);
		let (selected_tx, _) = watch::channel(None);

		SessionController {
			session: Mutex::new(TunnelSession::new(provider)),
			catalog: RwLock::new(resolvers),
			state_tx,
			testing_tx,
			selected_tx,
			busy: AtomicBool::new(false),
			prepared: AtomicBool::new(false),
			next_custom_id: AtomicU32::new(next_custom_id),
		}
	}

	// ── Observables ─────────────────────────────────────────────────────

	pub fn state(&self) -> watch::Receiver<ConnectionState> {
		self.state_tx.subscribe()
	}

	pub fn testing(&self) -> watch::Receiver<Option<u32>> {
		self.testing_tx.subscribe()
	}

	pub fn selected(&self) -> watch::Receiver<Option<u32>> {
		self.selected_tx.subscribe()
	}

	pub fn current_state(&self) -> ConnectionState {
		self.state_tx.borrow().clone()
	}

	/// Snapshot of the catalog including attached test results.
	pub fn resolvers(&self) -> Vec<Resolver> {
		self.catalog.read().expect("catalog lock poisoned").clone()
	}

	// ── Requests ────────────────────────────────────────────────────────

	/// Connect to a resolver, or disconnect when already connected
	/// (connect/disconnect is a single affordance).
	pub async fn request_connect(&self, id: u32) -> Result<(), ControllerError> {
		if let ConnectionState::Connected(stats) = self.current_state() {
			log::info!(
				"connect requested while connected to {} (id {}), toggling off",
				stats.resolver_name, stats.resolver_id,
			);
			self.request_disconnect().await;
			return Ok(());
		}

		let _op = self.begin_op()?;
		let resolver = self.find(id)?;

		self.publish(ConnectionState::Connecting);
		let mut session = self.session.lock().await;

		if !self.prepared.load(Ordering::Acquire) {
			if let Err(e) = session.prepare() {
				self.publish(ConnectionState::Error(e.to_string()));
				return Err(e.into());
			}
			self.prepared.store(true, Ordering::Release);
		}

		match session.establish(&resolver) {
			Ok(()) => {
				let stats = session.snapshot()
					.map(stats_from_snapshot)
					.unwrap_or_else(|| ConnectionStats {
						resolver_id: resolver.id,
						resolver_name: resolver.name.clone(),
						connected_at: SystemTime::now(),
						uptime: Duration::ZERO,
						latency_ms: 0,
						bytes_relayed: 0,
					});
				self.publish(ConnectionState::Connected(stats));
				Ok(())
			}
			Err(e) => {
				log::debug!("tunnel state after failed establish: {:?}", session.state());
				self.publish(ConnectionState::Error(e.to_string()));
				Err(e.into())
			}
		}
	}

	/// Tear down the tunnel. The observable state becomes Disconnected
	/// unconditionally; teardown problems are logged, never surfaced.
	pub async fn request_disconnect(&self) {
		let mut session = self.session.lock().await;
		session.teardown();
		drop(session);
		self.publish(ConnectionState::Disconnected);
	}

	/// The OS or the user withdrew the tunnel grant outside our control.
	/// Same teardown path as an explicit disconnect; observers see
	/// Disconnected, not Error, since this is user-initiated.
	pub async fn on_revoked(&self) {
		log::warn!("tunnel grant revoked externally");
		self.request_disconnect().await;
	}

	/// Probe the full catalog and select the winner by average latency.
	///
	/// Publishes the id under test as the run progresses and attaches each
	/// result to its catalog entry. Selects, but does not connect. Returns
	/// None when no resolver produced a successful result.
	pub async fn request_find_best(
		&self,
		config: &ProbeConfig,
	) -> Result<Option<(u32, TestResult)>, ControllerError> {
		let _op = self.begin_op()?;
		let snapshot = self.resolvers();

		let best = rank::rank_best(&snapshot, config, |event| {
			match event {
				RankEvent::Testing(id) => {
					self.testing_tx.send_replace(Some(id));
				}
				RankEvent::Tested(_, result) => {
					let mut list = self.catalog.write().expect("catalog lock poisoned");
					catalog::attach_result(&mut list, result.clone());
				}
			}
		}).await;
		self.testing_tx.send_replace(None);

		match best {
			Some((resolver, result)) => {
				log::info!("best resolver: {} ({} ms avg)", resolver.name, result.avg_ms());
				self.selected_tx.send_replace(Some(resolver.id));
				Ok(Some((resolver.id, result)))
			}
			None => {
				log::warn!("no resolver produced a successful test");
				Ok(None)
			}
		}
	}

	/// Probe a single catalog entry and attach the result.
	pub async fn request_test(
		&self,
		id: u32,
		config: &ProbeConfig,
	) -> Result<TestResult, ControllerError> {
		let _op = self.begin_op()?;
		let resolver = self.find(id)?;

		self.testing_tx.send_replace(Some(id));
		let result = crate::probe::probe(id, resolver.primary_socket(), config).await;
		self.testing_tx.send_replace(None);

		let mut list = self.catalog.write().expect("catalog lock poisoned");
		catalog::attach_result(&mut list, result.clone());
		Ok(result)
	}

	/// Refresh the Connected stats from the live session.
	///
	/// Publishes only while the tunnel is still active, so a stale refresh
	/// landing after a disconnect cannot flip the state back to Connected.
	pub async fn refresh_stats(&self) {
		let session = self.session.lock().await;
		if !session.is_active() {
			return;
		}
		if let Some(snapshot) = session.snapshot() {
			if self.current_state().is_connected() {
				self.state_tx.send_replace(ConnectionState::Connected(stats_from_snapshot(snapshot)));
			}
		}
	}

	// ── Custom resolvers ────────────────────────────────────────────────

	/// Add a user-supplied resolver ("ip" or "primary,secondary").
	pub fn add_custom(&self, input: &str) -> anyhow::Result<u32> {
		let id = self.next_custom_id.fetch_add(1, Ordering::SeqCst);
		let resolver = catalog::parse_custom(id, input)?;
		self.catalog.write().expect("catalog lock poisoned").push(resolver);
		Ok(id)
	}

	/// Remove a user-added resolver. Predefined entries are permanent.
	#[allow(dead_code)]
	pub fn remove_custom(&self, id: u32) -> Result<(), ControllerError> {
		let mut list = self.catalog.write().expect("catalog lock poisoned");
		let resolver = list.iter()
			.find(|r| r.id == id)
			.ok_or(ControllerError::UnknownResolver(id))?;
		if resolver.category != ResolverCategory::Custom {
			return Err(ControllerError::NotRemovable(id));
		}
		list.retain(|r| r.id != id);
		Ok(())
	}

	// ── Internals ───────────────────────────────────────────────────────

	fn find(&self, id: u32) -> Result<Resolver, ControllerError> {
		self.catalog.read().expect("catalog lock poisoned").iter()
			.find(|r| r.id == id)
			.cloned()
			.ok_or(ControllerError::UnknownResolver(id))
	}

	fn publish(&self, state: ConnectionState) {
		log::info!("connection state: {}", state.label());
		self.state_tx.send_replace(state);
	}

	fn begin_op(&self) -> Result<OpGuard<'_>, ControllerError> {
		if self.busy
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_err()
		{
			return Err(ControllerError::Busy);
		}
		Ok(OpGuard(&self.busy))
	}
}

fn stats_from_snapshot(snapshot: crate::tunnel::SessionSnapshot) -> ConnectionStats {
	ConnectionStats {
		resolver_id: snapshot.resolver_id,
		resolver_name: snapshot.resolver_name,
		connected_at: snapshot.started_at,
		uptime: snapshot.uptime,
		latency_ms: snapshot.latency_ms,
		bytes_relayed: snapshot.bytes_relayed,
	}
}

/// Clears the in-flight flag when the operation ends, error paths included.
struct OpGuard<'a>(&'a AtomicBool);

impl Drop for OpGuard<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::Release);
	}
}
