use std::net::{IpAddr, SocketAddr};

use anyhow::{anyhow, Result};

use crate::stats::TestResult;

/// Ids at or above this value belong to user-added resolvers.
pub const CUSTOM_ID_BASE: u32 = 1000;

/// Category tag for catalog grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverCategory {
	Global,
	Gaming,
	Custom,
}

impl ResolverCategory {
	pub fn label(&self) -> &'static str {
		match self {
			ResolverCategory::Global => "global",
			ResolverCategory::Gaming => "gaming",
			ResolverCategory::Custom => "custom",
		}
	}
}

/// A DNS resolver a user can route queries through.
///
/// Immutable apart from `last_result`, which is replaced wholesale each
/// time the resolver is retested.
#[derive(Debug, Clone)]
pub struct Resolver {
	pub id: u32,
	pub name: String,
	pub primary: IpAddr,
	pub secondary: IpAddr,
	pub category: ResolverCategory,
	pub last_result: Option<TestResult>,
}

impl Resolver {
	pub fn primary_socket(&self) -> SocketAddr {
		SocketAddr::new(self.primary, 53)
	}
}

fn entry(id: u32, name: &str, primary: &str, secondary: &str, category: ResolverCategory) -> Resolver {
	Resolver {
		id,
		name: name.to_string(),
		primary: primary.parse().unwrap(),
		secondary: secondary.parse().unwrap(),
		category,
		last_result: None,
	}
}

/// The predefined resolver catalog.
pub fn predefined() -> Vec<Resolver> {
	vec![
		entry(1, "Google DNS", "8.8.8.8", "8.8.4.4", ResolverCategory::Global),
		entry(2, "Cloudflare DNS", "1.1.1.1", "1.0.0.1", ResolverCategory::Global),
		entry(3, "OpenDNS", "208.67.222.222", "208.67.220.220", ResolverCategory::Global),
		entry(4, "Quad9", "9.9.9.9", "149.112.112.112", ResolverCategory::Global),
		entry(5, "AdGuard DNS", "94.140.14.14", "94.140.15.15", ResolverCategory::Global),
		entry(10, "Cloudflare Gaming", "1.1.1.1", "1.0.0.1", ResolverCategory::Gaming),
		entry(11, "Google Gaming", "8.8.8.8", "8.8.4.4", ResolverCategory::Gaming),
	]
}

/// Parse a user-supplied resolver from "ip" or "primary,secondary".
///
/// A single address is used for both primary and secondary.
pub fn parse_custom(id: u32, input: &str) -> Result<Resolver> {
	let trimmed = input.trim();
	if trimmed.is_empty() {
		return Err(anyhow!("empty resolver address"));
	}

	let (primary_str, secondary_str) = match trimmed.split_once(',') {
		Some((p, s)) => (p.trim(), s.trim()),
		None => (trimmed, trimmed),
	};

	let primary: IpAddr = primary_str.parse()
		.map_err(|e| anyhow!("invalid IP address '{}': {}", primary_str, e))?;
	let secondary: IpAddr = secondary_str.parse()
		.map_err(|e| anyhow!("invalid IP address '{}': {}", secondary_str, e))?;

	Ok(Resolver {
		id,
		name: format!("Custom {}", primary),
		primary,
		secondary,
		category: ResolverCategory::Custom,
		last_result: None,
	})
}

/// Read custom resolvers from a file, one per line.
///
/// Blank lines and lines starting with '#' are skipped. Ids are assigned
/// sequentially from `base_id`.
pub fn read_resolver_file(path: &str, base_id: u32) -> Result<Vec<Resolver>> {
	let content = std::fs::read_to_string(path)
		.map_err(|e| anyhow!("failed to read resolver file '{}': {}", path, e))?;
	let mut resolvers = Vec::new();
	for line in content.lines() {
		let trimmed = line.trim();
		if trimmed.is_empty() || trimmed.starts_with('#') {
			continue;
		}
		let id = base_id + resolvers.len() as u32;
		resolvers.push(parse_custom(id, trimmed)?);
	}
	Ok(resolvers)
}

/// Attach a fresh test result to the matching catalog entry.
pub fn attach_result(resolvers: &mut [Resolver], result: TestResult) {
	if let Some(r) = resolvers.iter_mut().find(|r| r.id == result.resolver_id) {
		r.last_result = Some(result);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::stats::ProbeSample;
	use std::time::Duration;

	#[test]
	fn test_single_address() {
		let r = parse_custom(1000, "192.0.2.1").unwrap();
		assert_eq!(r.primary.to_string(), "192.0.2.1");
		assert_eq!(r.secondary, r.primary);
		assert_eq!(r.category, ResolverCategory::Custom);
	}

	#[test]
	fn test_address_pair() {
		let r = parse_custom(1001, "1.1.1.1, 1.0.0.1").unwrap();
		assert_eq!(r.primary.to_string(), "1.1.1.1");
		assert_eq!(r.secondary.to_string(), "1.0.0.1");
	}

	#[test]
	fn test_ipv6_address() {
		let r = parse_custom(1002, "2606:4700::1111").unwrap();
		assert_eq!(r.primary_socket().port(), 53);
	}

	#[test]
	fn test_invalid_input() {
		assert!(parse_custom(1000, "not-an-ip").is_err());
		assert!(parse_custom(1000, "").is_err());
	}

	#[test]
	fn test_predefined_ids_unique() {
		let servers = predefined();
		assert!(!servers.is_empty());
		let mut ids: Vec<u32> = servers.iter().map(|r| r.id).collect();
		ids.sort_unstable();
		ids.dedup();
		assert_eq!(ids.len(), servers.len());
		assert!(ids.iter().all(|&id| id < CUSTOM_ID_BASE));
	}

	#[test]
	fn test_attach_result_replaces() {
		let mut servers = predefined();
		let first = TestResult::from_samples(1, &[ProbeSample::ok(Duration::from_millis(30))]);
		attach_result(&mut servers, first);
		let second = TestResult::from_samples(1, &[ProbeSample::ok(Duration::from_millis(9))]);
		attach_result(&mut servers, second);

		let entry = servers.iter().find(|r| r.id == 1).unwrap();
		let result = entry.last_result.as_ref().unwrap();
		assert_eq!(result.avg, Duration::from_millis(9));
	}
}
