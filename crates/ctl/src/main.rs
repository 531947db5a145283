//! SID control and query tool.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use sid_proto::types::{MsgHeader, OutputFormat, STATUS_FAILURE, SidCmd};
use sid_proto::{fdpass, frame, memfd};
use sid_ubridge::fmt;
use tokio::net::UnixStream;

/// Output format flag.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Format {
	/// Human-readable table.
	#[default]
	Table,
	/// JSON document.
	Json,
	/// `KEY=VALUE` lines.
	Env,
}

impl From<Format> for OutputFormat {
	fn from(f: Format) -> Self {
		match f {
			Format::Table => Self::Table,
			Format::Json => Self::Json,
			Format::Env => Self::Env,
		}
	}
}

/// Tool command line arguments.
#[derive(Parser, Debug)]
#[command(name = "sidctl", version)]
#[command(about = "Control and query the Storage Instantiation Daemon")]
struct Args {
	/// Output format
	#[arg(short, long, value_enum, default_value_t = Format::Table)]
	format: Format,

	/// Verbose logging (repeatable)
	#[arg(short, long, action = clap::ArgAction::Count)]
	verbose: u8,

	/// Socket path of the daemon
	#[arg(short, long, value_name = "PATH")]
	socket: Option<PathBuf>,

	#[command(subcommand)]
	command: Command,
}

/// Tool subcommands.
#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
	/// Report tool and daemon versions.
	Version,
	/// Dump the daemon's key-value store.
	Dbdump,
	/// Report key-value store statistics.
	Dbstats,
	/// List tracked devices.
	Devices,
	/// Dump the daemon's resource tree.
	Resources,
}

impl Command {
	fn sid_cmd(self) -> SidCmd {
		match self {
			Self::Version => SidCmd::Version,
			Self::Dbdump => SidCmd::DbDump,
			Self::Dbstats => SidCmd::DbStats,
			Self::Devices => SidCmd::Devices,
			Self::Resources => SidCmd::Resources,
		}
	}
}

async fn run_command(args: &Args) -> anyhow::Result<()> {
	let format = OutputFormat::from(args.format);

	if matches!(args.command, Command::Version) {
		let local = fmt::render(format, &fmt::version_value("SIDCTL_VERSION"));
		print!("{}", String::from_utf8_lossy(&local));
	}

	let socket_path = args
		.socket
		.clone()
		.unwrap_or_else(sid_proto::paths::socket_path);
	let mut conn = UnixStream::connect(&socket_path).await?;

	let header = MsgHeader::request(args.command.sid_cmd(), format.to_flags());
	frame::write_frame(&mut conn, &header.encode()).await?;

	let response = frame::read_frame(&mut conn).await?;
	let res_header = MsgHeader::decode(&response)?;
	if res_header.status & STATUS_FAILURE != 0 {
		anyhow::bail!("command failed");
	}

	let body = &response[MsgHeader::SIZE..];
	if !body.is_empty() {
		print!("{}", String::from_utf8_lossy(body));
	}

	// dump commands hand the formatted export over as a descriptor
	if matches!(args.command, Command::Dbdump) {
		let fd = fdpass::recv_fd(&conn).await?;
		if let Some(dump) = memfd::read_sized(fd)? {
			print!("{}", String::from_utf8_lossy(&dump));
		}
	}

	Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let args = Args::parse();

	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::new(match args.verbose {
			0 => "warn",
			1 => "info",
			_ => "debug",
		}))
		.with_writer(std::io::stderr)
		.init();

	match run_command(&args).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			tracing::error!(error = %e, "command request failed");
			ExitCode::FAILURE
		}
	}
}
