//! Command-line interface definition.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bellhop", version, about = "Browser session lifecycle and portal authentication service")]
pub struct Cli {
	/// Address the HTTP API listens on.
	#[arg(long, default_value = "127.0.0.1:7087")]
	pub listen: String,

	/// Browser executable; discovered on PATH when omitted.
	#[arg(long)]
	pub browser: Option<PathBuf>,

	/// Default log filter, overridden by RUST_LOG.
	#[arg(long, default_value = "bellhop=info,bellhop_cli=info")]
	pub log: String,

	/// Skip startup recovery of persisted sessions.
	#[arg(long)]
	pub no_recover: bool,
}
