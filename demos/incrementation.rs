//! Increments every byte of every file in a directory, `iterations` times in
//! a row, writing each step to the output directory.
//!
//! Each file is processed on its own chain of instances, and every step is
//! cached under `<output dir>/.kumiki`, so running the demo twice only does
//! the work once.

use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use kumiki::{BenchmarkLog, Blueprint, Inputs, Outputs, RunConfig, Submitter, TaskNode, discover};

#[derive(Parser, Debug)]
#[command(version, about = "Byte incrementation pipeline")]
struct Args {
    /// Directory with the input files.
    input_dir: Utf8PathBuf,
    /// Directory to write incremented files to.
    output_dir: Utf8PathBuf,
    /// Number of times every file is incremented.
    iterations: usize,
    /// Seconds slept by each step.
    delay: f64,
    /// Append one line per step to `<output dir>/benchmark-<experiment>.out`.
    #[arg(long)]
    benchmark: bool,
    /// Label of the run.
    #[arg(long, default_value = "default")]
    experiment: String,
    /// Maximum number of steps running at once.
    #[arg(short, long)]
    jobs: Option<usize>,
}

fn output_name(input: &Utf8Path, iteration: usize) -> anyhow::Result<String> {
    let basename = input
        .file_name()
        .with_context(|| format!("{input} has no file name"))?;

    Ok(if iteration > 0 {
        format!(
            "{iteration}{}",
            basename.trim_start_matches(|c: char| c.is_ascii_digit())
        )
    } else {
        format!("{iteration}inc-{basename}")
    })
}

fn increment(inputs: &Inputs) -> anyhow::Result<Outputs> {
    let filename = Utf8PathBuf::from(inputs.str("filename")?);
    let output_dir = Utf8PathBuf::from(inputs.str("output_dir")?);
    let iteration: usize = inputs.get("it")?;
    let delay: f64 = inputs.get("delay")?;

    let mut data = std::fs::read(&filename).with_context(|| format!("Couldn't read {filename}"))?;
    for byte in &mut data {
        *byte = byte.wrapping_add(1);
    }

    std::thread::sleep(Duration::from_secs_f64(delay));

    let out_path = output_dir.join(output_name(&filename, iteration)?);
    std::fs::write(&out_path, data).with_context(|| format!("Couldn't write {out_path}"))?;

    Ok(Outputs::new().with("out", out_path.as_str()))
}

fn main() -> anyhow::Result<()> {
    kumiki::init_logging()?;

    let args = Args::parse();
    anyhow::ensure!(args.iterations > 0, "at least one iteration is required");

    std::fs::create_dir_all(&args.output_dir)?;
    let paths = discover::crawl_dir(&args.input_dir)?;
    tracing::info!("Found {} input file(s) in {}", paths.len(), args.input_dir);

    let mut blueprint = Blueprint::new();
    let files = blueprint.split("f", paths.iter().map(|path| path.as_str()))?;

    let step = |name: String, filename: kumiki::Binding, it: usize| {
        TaskNode::builder(name)
            .input("filename", filename)
            .input("output_dir", args.output_dir.as_path())
            .input("it", it)
            .input("delay", args.delay)
            .track_file("filename")
            .identify_by("filename")
            .output("out")
            .run(increment)
    };

    let name = blueprint.generate_name("increment");
    let mut previous = blueprint.add_node(step(name, files.into(), 0))?;

    for it in 1..args.iterations {
        let name = blueprint.generate_name("increment");
        previous = blueprint.add_node(step(name, previous.out("out").into(), it))?;
    }

    blueprint.combine("f")?;
    let workflow = blueprint.finalize([("out", previous.out("out"))])?;

    let mut config = RunConfig::default()
        .cache_dir(args.output_dir.join(".kumiki"))
        .label(&args.experiment)
        .output_dir(&args.output_dir);

    if let Some(jobs) = args.jobs {
        config = config.jobs(jobs);
    }

    if args.benchmark {
        config = config.telemetry(BenchmarkLog::in_dir(&args.output_dir, &args.experiment)?);
    }

    let outcome = Submitter::new(config)?.run(&workflow)?;

    println!("{}", serde_json::to_string_pretty(&outcome.outputs)?);
    println!(
        "{} step(s) executed, {} served from cache",
        outcome.executed(),
        outcome.cached()
    );

    Ok(())
}
