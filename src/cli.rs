use clap::{Parser, Subcommand};

/// Gaming DNS switcher: rank public resolvers by latency and route DNS
/// traffic through the best one via a local tunnel.
#[derive(Parser, Debug)]
#[command(name = "gamedns")]
#[command(about = "Rank DNS resolvers by latency and tunnel DNS traffic through the winner")]
pub struct Cli {
	/// Custom resolver address, "ip" or "primary,secondary" (repeatable)
	#[arg(short = 'r', long = "resolver")]
	pub resolvers: Vec<String>,

	/// File containing custom resolver addresses (one per line)
	#[arg(short = 'f', long = "resolver-file")]
	pub resolver_file: Option<String>,

	#[command(subcommand)]
	pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
	/// List the resolver catalog
	List,

	/// Measure latency for one resolver, or the whole catalog
	Test {
		/// Resolver id to test; omit to test every catalog entry
		#[arg(long)]
		id: Option<u32>,

		#[command(flatten)]
		probe: ProbeArgs,

		/// Output CSV file path
		#[arg(short = 'o', long = "output")]
		output: Option<String>,
	},

	/// Probe every resolver and select the best by average latency
	Best {
		#[command(flatten)]
		probe: ProbeArgs,

		/// Output CSV file path
		#[arg(short = 'o', long = "output")]
		output: Option<String>,
	},

	/// Establish the DNS tunnel and run until interrupted (ctrl-c)
	Connect {
		/// Resolver id to connect to
		#[arg(long, conflicts_with = "best")]
		id: Option<u32>,

		/// Rank the catalog first and connect to the winner
		#[arg(long)]
		best: bool,

		#[command(flatten)]
		probe: ProbeArgs,
	},
}

/// Probe tuning shared by the measuring subcommands.
#[derive(clap::Args, Debug)]
pub struct ProbeArgs {
	/// Use the gaming preset (3 samples, 3000 ms timeout, 50 ms delay)
	#[arg(long)]
	pub gaming: bool,

	/// Domain resolved by each sample
	#[arg(long)]
	pub domain: Option<String>,

	/// Samples per resolver
	#[arg(long)]
	pub samples: Option<u32>,

	/// Per-sample timeout in milliseconds
	#[arg(short = 't', long = "timeout")]
	pub timeout: Option<u64>,

	/// Time raw TCP connects to port 53 instead of full resolutions
	#[arg(long)]
	pub tcp: bool,
}
