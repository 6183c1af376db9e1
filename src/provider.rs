use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use crate::catalog::Resolver;
use crate::tunnel::TunnelError;

/// Parameters handed to the OS when creating the virtual interface.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
	pub local_addr: IpAddr,
	pub prefix_len: u8,
	/// Primary and secondary DNS servers the interface pins.
	pub dns: (IpAddr, IpAddr),
	/// Catch-all route so DNS traffic enters the interface.
	pub route: IpAddr,
	pub mtu: u16,
	pub session_name: String,
}

impl TunnelConfig {
	pub fn for_resolver(resolver: &Resolver) -> Self {
		TunnelConfig {
			local_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
			prefix_len: 24,
			dns: (resolver.primary, resolver.secondary),
			route: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
			mtu: 1500,
			session_name: format!("gamedns - {}", resolver.name),
		}
	}
}

/// An open OS tunnel interface.
pub trait TunnelHandle: Send + Sync {
	/// Blocking read of the next inbound packet.
	///
	/// Returns Ok(0) when `poll` elapses with no data, so a relay loop can
	/// recheck its stop flag at poll granularity.
	fn read_packet(&self, buf: &mut [u8], poll: Duration) -> io::Result<usize>;

	/// Close the interface. Safe to call more than once.
	fn close(&self);
}

/// Capability boundary over the platform's VPN machinery.
///
/// The core state machine never touches OS specifics directly; platform
/// variants (Android VpnService builder, utun, wintun) implement this trait.
pub trait TunnelProvider: Send + Sync {
	/// Request user permission if the platform needs a grant step before
	/// the first establish. Idempotent.
	fn prepare(&self) -> Result<(), TunnelError>;

	/// Ask the OS to create the interface. A denial is returned as an
	/// error; no retry is attempted by the caller.
	fn establish(&self, config: &TunnelConfig) -> Result<Box<dyn TunnelHandle>, TunnelError>;

	/// Register the persistent foreground indicator naming the session.
	fn show_indicator(&self, text: &str);

	/// Remove the foreground indicator.
	fn clear_indicator(&self);
}

// ── Loopback provider ───────────────────────────────────────────────────────

struct LoopbackShared {
	deny_next: AtomicBool,
	open_handles: AtomicUsize,
	indicator: Mutex<Option<String>>,
	feed: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

/// In-process tunnel provider backed by a byte-chunk channel.
///
/// Carries no real traffic; it exists so the session machinery can run on
/// any platform (demo CLI) and so tests can inject packets, deny the grant,
/// and observe handle lifetimes.
pub struct LoopbackProvider {
	shared: Arc<LoopbackShared>,
}

impl LoopbackProvider {
	pub fn new() -> Self {
		LoopbackProvider {
			shared: Arc::new(LoopbackShared {
				deny_next: AtomicBool::new(false),
				open_handles: AtomicUsize::new(0),
				indicator: Mutex::new(None),
				feed: Mutex::new(None),
			}),
		}
	}

	/// Current indicator text, if a session is announced.
	pub fn indicator(&self) -> Option<String> {
		self.shared.indicator.lock().unwrap().clone()
	}

	/// Make the next establish call fail, simulating an OS denial.
	#[cfg(test)]
	pub fn deny_next(&self) {
		self.shared.deny_next.store(true, Ordering::SeqCst);
	}

	/// Number of handles established and not yet closed.
	#[cfg(test)]
	pub fn open_handles(&self) -> usize {
		self.shared.open_handles.load(Ordering::SeqCst)
	}

	/// Push a packet into the currently open handle.
	#[cfg(test)]
	pub fn inject(&self, packet: Vec<u8>) -> bool {
		match self.shared.feed.lock().unwrap().as_ref() {
			Some(tx) => tx.send(packet).is_ok(),
			None => false,
		}
	}
}

impl Default for LoopbackProvider {
	fn default() -> Self {
		Self::new()
	}
}

impl TunnelProvider for LoopbackProvider {
	fn prepare(&self) -> Result<(), TunnelError> {
		Ok(())
	}

	fn establish(&self, config: &TunnelConfig) -> Result<Box<dyn TunnelHandle>, TunnelError> {
		if self.shared.deny_next.swap(false, Ordering::SeqCst) {
			return Err(TunnelError::Establish("tunnel grant denied by the system".to_string()));
		}

		log::debug!(
			"loopback establish: {} {}/{} dns {} / {} mtu {}",
			config.session_name, config.local_addr, config.prefix_len,
			config.dns.0, config.dns.1, config.mtu,
		);

		let (tx, rx) = mpsc::channel();
		*self.shared.feed.lock().unwrap() = Some(tx);
		self.shared.open_handles.fetch_add(1, Ordering::SeqCst);

		Ok(Box::new(LoopbackHandle {
			rx: Mutex::new(rx),
			closed: AtomicBool::new(false),
			shared: Arc::clone(&self.shared),
		}))
	}

	fn show_indicator(&self, text: &str) {
		*self.shared.indicator.lock().unwrap() = Some(text.to_string());
	}

	fn clear_indicator(&self) {
		*self.shared.indicator.lock().unwrap() = None;
	}
}

struct LoopbackHandle {
	rx: Mutex<mpsc::Receiver<Vec<u8>>>,
	closed: AtomicBool,
	shared: Arc<LoopbackShared>,
}

impl TunnelHandle for LoopbackHandle {
	fn read_packet(&self, buf: &mut [u8], poll: Duration) -> io::Result<usize> {
		if self.closed.load(Ordering::SeqCst) {
			return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed"));
		}
		let rx = self.rx.lock().unwrap();
		match rx.recv_timeout(poll) {
			Ok(packet) => {
				let n = packet.len().min(buf.len());
				buf[..n].copy_from_slice(&packet[..n]);
				Ok(n)
			}
			Err(mpsc::RecvTimeoutError::Timeout) => Ok(0),
			Err(mpsc::RecvTimeoutError::Disconnected) => {
				Err(io::Error::new(io::ErrorKind::BrokenPipe, "tunnel feed dropped"))
			}
		}
	}

	fn close(&self) {
		if !self.closed.swap(true, Ordering::SeqCst) {
			self.shared.open_handles.fetch_sub(1, Ordering::SeqCst);
			// Drop the feed sender so pending reads unblock with an error
			self.shared.feed.lock().unwrap().take();
		}
	}
}
