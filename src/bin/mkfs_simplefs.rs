//! `mkfs-simplefs`: formats a device or regular file as a SimpleFS volume.
//!
//! Grounded on the argument shape of `other_examples/a843a820_freddiehaddad-ferrous`'s mkfs tool
//! (clap derive CLI) and on `maestro-os-maestro-utils/mkfs/src/main.rs` for reporting the result
//! back to the operator in terms of the regions the formatter laid out.

use clap::Parser;
use simplefs::fs::{FormatOptions, Filesystem};
use simplefs::Error;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

/// Maps a library error to a process exit code, following the traditional errno numbering so a
/// caller scripting around this tool can distinguish failure kinds without parsing stderr.
fn exit_code(err: &Error) -> ExitCode {
	const ENOENT: u8 = 2;
	const EIO: u8 = 5;
	const ENODEV: u8 = 19;
	const EEXIST: u8 = 17;
	const EINVAL: u8 = 22;
	const ENAMETOOLONG: u8 = 36;
	const EFBIG: u8 = 27;
	const ENOSPC: u8 = 28;

	let code = match err {
		Error::Io(e) if e.kind() == io::ErrorKind::NotFound => ENODEV,
		Error::Io(_) => EIO,
		Error::CorruptHeader(_) => EIO,
		Error::OutOfRange(_) => EINVAL,
		Error::NotFound => ENOENT,
		Error::NoSpace => ENOSPC,
		Error::NameTooLong => ENAMETOOLONG,
		Error::FileTooLarge => EFBIG,
		Error::Invalid(_) => EINVAL,
		Error::AlreadyExists => EEXIST,
	};
	ExitCode::from(code)
}

/// Format a block device or regular file as a SimpleFS volume.
#[derive(Debug, Parser)]
#[command(name = "mkfs-simplefs", version, about)]
struct Cli {
	/// Path to the device or file to format.
	device: PathBuf,

	/// Number of inodes to reserve room for. Defaults to 1024, or to the config file's value if
	/// `--config` is given and this flag is not.
	#[arg(long)]
	inodes: Option<u64>,

	/// Write the volume in big-endian byte order instead of little-endian. Only overrides the
	/// config file's `big_endian` setting when actually passed.
	#[arg(long, num_args = 0..=1, default_missing_value = "true")]
	big_endian: Option<bool>,

	/// Load format options from a TOML config file, overriding the defaults (but not flags
	/// explicitly passed on the command line).
	#[arg(long)]
	config: Option<PathBuf>,
}

fn load_options(cli: &Cli) -> simplefs::Result<FormatOptions> {
	let mut options = match &cli.config {
		Some(path) => {
			let text = std::fs::read_to_string(path)?;
			toml::from_str(&text).map_err(|_| simplefs::Error::Invalid("malformed config file"))?
		}
		None => FormatOptions::default(),
	};
	if let Some(inodes) = cli.inodes {
		options.max_inodes = inodes;
	}
	if let Some(big_endian) = cli.big_endian {
		options.big_endian = big_endian;
	}
	Ok(options)
}

fn main() -> ExitCode {
	env_logger::init();
	let cli = Cli::parse();

	let options = match load_options(&cli) {
		Ok(options) => options,
		Err(e) => {
			eprintln!("mkfs-simplefs: {e}");
			return exit_code(&e);
		}
	};

	match Filesystem::format(&cli.device, &options) {
		Ok(()) => {
			println!(
				"mkfs-simplefs: formatted {} with {} inodes ({}-endian)",
				cli.device.display(),
				options.max_inodes,
				if options.big_endian { "big" } else { "little" }
			);
			ExitCode::SUCCESS
		}
		Err(e) => {
			eprintln!("mkfs-simplefs: {e}");
			exit_code(&e)
		}
	}
}
