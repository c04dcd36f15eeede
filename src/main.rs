use std::{num::NonZeroUsize, path::PathBuf, process, sync::Arc};

use clap::Parser;
use minihyvelib::{
	checkpoint::CheckpointConfig,
	params::Params,
	vm::{DefaultBackend, MonitorVm},
};

#[derive(Parser, Debug)]
#[command(
	version,
	about = "A minimal hypervisor monitor for classic Hermit unikernels",
	after_help = "All runtime configuration is read from HERMIT_* environment variables."
)]
struct Args {
	/// Path of the kernel image to boot.
	#[arg(value_name = "KERNEL")]
	kernel: PathBuf,

	/// Arguments forwarded to the guest application.
	#[arg(value_name = "ARGS", trailing_var_arg = true)]
	kernel_args: Vec<String>,
}

fn main() {
	let args = Args::parse();

	let mut params = Params::from_env().unwrap_or_else(|e| {
		eprintln!("invalid configuration: {e}");
		process::exit(1);
	});
	params.kernel_args = args.kernel_args;

	env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
		if params.verbose { "debug" } else { "warn" },
	))
	.init();

	// A checkpoint descriptor next to the working directory means this run
	// resumes instead of booting fresh.
	let restore = CheckpointConfig::exists().then(|| {
		CheckpointConfig::load().unwrap_or_else(|e| {
			eprintln!("unable to read the checkpoint descriptor: {e}");
			process::exit(1);
		})
	});
	if let Some(chk) = &restore {
		params.cpu_count = chk.num_cpus.try_into().unwrap_or_else(|_| {
			eprintln!("checkpoint descriptor carries an invalid cpu count");
			process::exit(1);
		});
		params.memory_size = NonZeroUsize::new(chk.mem_size).unwrap_or_else(|| {
			eprintln!("checkpoint descriptor carries an invalid memory size");
			process::exit(1);
		});
		params.full_checkpoint = chk.full;
	}

	let mut vm = MonitorVm::<DefaultBackend>::new(args.kernel, params, restore.as_ref())
		.unwrap_or_else(|e| {
			eprintln!("unable to create the virtual machine: {e}");
			process::exit(1);
		});

	let load_result = match &restore {
		Some(chk) => vm
			.load_checkpoint(chk)
			.map_err(|e| format!("unable to restore the checkpoint: {e}")),
		None => vm
			.load_kernel()
			.map_err(|e| format!("unable to load the kernel: {e}")),
	};
	if let Err(e) = load_result {
		eprintln!("{e}");
		process::exit(1);
	}

	let code = Arc::new(vm).run();
	process::exit(code);
}
