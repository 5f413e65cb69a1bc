//! Command-line front end: add two random vectors on the GPU and write the
//! sums to a text file, one value per line.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use vulkan_compute_framework::{ComputeJob, JobConfig, ShaderSource};

#[derive(Parser, Debug)]
#[command(name = "vulkan-compute", version, about)]
struct Cli {
    /// SPIR-V compute shader with bindings 0, 1 (inputs) and 2 (output)
    #[arg(long, default_value = "shaders/comp.spv")]
    shader: PathBuf,

    /// Number of f32 elements per buffer
    #[arg(long, default_value_t = 1024 * 1024)]
    elements: u32,

    /// Elements per workgroup (the shader's local size)
    #[arg(long, default_value_t = 1)]
    workgroup_size: u32,

    /// Device extension the GPU must support (repeatable)
    #[arg(long = "extension")]
    extensions: Vec<String>,

    /// Enable VK_LAYER_KHRONOS_validation if it is installed
    #[arg(long)]
    validation: bool,

    /// Where to write the result
    #[arg(long, default_value = "result.txt")]
    output: PathBuf,

    /// Number of times to submit the dispatch
    #[arg(long, default_value_t = 1)]
    runs: u32,
}

fn write_result(path: &Path, values: &[f32]) -> std::io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for v in values {
        writeln!(out, "{v}")?;
    }
    out.flush()
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = JobConfig::default()
        .with_element_count(cli.elements)
        .with_workgroup_size(cli.workgroup_size)
        .with_shader(ShaderSource::Path(cli.shader))
        .with_validation(cli.validation);
    config.required_extensions = cli.extensions;

    let mut job = ComputeJob::new(config);
    if let Err(err) = job.init() {
        error!("initialization failed: {err}");
        return ExitCode::FAILURE;
    }
    for run in 0..cli.runs {
        if let Err(err) = job.run() {
            error!("run {run} failed: {err}");
            return ExitCode::FAILURE;
        }
    }

    let result = match job.try_result() {
        Ok(values) => values,
        Err(err) => {
            error!("could not read the result: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = write_result(&cli.output, &result) {
        error!("could not write {}: {err}", cli.output.display());
        return ExitCode::FAILURE;
    }
    info!("wrote {} values to {}", result.len(), cli.output.display());
    ExitCode::SUCCESS
}
