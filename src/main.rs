use clap::Parser;
use memscope::{
    GpuBackend, MemoryField, ProcessTarget, TargetMode, TrackerConfig, track_peak_memory,
};
use std::path::{Path, PathBuf};
use std::process::{Command, exit};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};


fn main() {
    let cli = Cli::parse();
    init_tracing();

    match run(cli) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("memscope: {}", e);
            exit(1);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memscope=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let target = match &cli.pids {
        Some(list) => ProcessTarget::from_pid_list(list, cli.target_mode)?,
        None => ProcessTarget::CurrentTree,
    };

    let config = TrackerConfig {
        interval: Duration::from_millis(cli.interval_ms.max(1)),
        target,
        memory_field: cli.field,
        backend: cli.backend,
        export_dir: None,
        export_prefix: None,
    };

    let (program, args) = cli
        .command
        .split_first()
        .ok_or("no command given")?;
    let name = cli.name.clone().unwrap_or_else(|| {
        Path::new(program)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone())
    });

    // The child is a descendant of this process, so the default target covers it.
    let (status, report) = track_peak_memory(&name, &config, || {
        Command::new(program).args(args).status()
    })?;
    let status = status.map_err(|e| format!("failed to run {}: {}", program, e))?;

    println!("{}", report);

    if let Some(output_folder) = &cli.json_dir {
        let filepath = report.write_json(output_folder, cli.prefix.as_deref())?;
        println!("Report saved to: {}", filepath.display());
    }

    Ok(status.code().unwrap_or(1))
}

#[derive(Parser)]
#[command(name = "memscope")]
#[command(
    about = "Report the peak CPU and GPU memory of a command and its children",
    long_about = None
)]
struct Cli {
    /// Sampling interval in milliseconds
    #[arg(short, long, env = "MEMSCOPE_INTERVAL_MS", default_value_t = 100)]
    interval_ms: u64,

    /// Comma-separated pids to measure instead of the command's process tree
    #[arg(long)]
    pids: Option<String>,

    /// Whether --pids is used verbatim or as roots of process trees
    #[arg(long, value_enum, default_value_t = TargetMode::Fixed)]
    target_mode: TargetMode,

    /// Memory counter read for each process
    #[arg(long, value_enum, default_value_t = MemoryField::Rss)]
    field: MemoryField,

    /// Source of GPU memory readings
    #[arg(long, value_enum, env = "MEMSCOPE_GPU_BACKEND", default_value_t = GpuBackend::NvidiaSmi)]
    backend: GpuBackend,

    /// Folder to write the JSON report into
    #[arg(long, env = "MEMSCOPE_JSON_DIR")]
    json_dir: Option<PathBuf>,

    /// Prefix for the JSON report file name
    #[arg(long)]
    prefix: Option<String>,

    /// Name shown in the report, defaults to the command name
    #[arg(long)]
    name: Option<String>,

    /// Command to run and measure
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}
