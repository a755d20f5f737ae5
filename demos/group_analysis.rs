//! Participant then group level analysis over a BIDS-like dataset.
//!
//! Every `sub-*/anat/*_T1w.nii*` (or `sub-*/ses-*/anat/*_T1w.nii*`) file is
//! masked on its own instance, writing a `_brain` file to the output
//! directory. The masks are then combined and the group node reports the mean
//! number of non-zero voxels.

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use glob::Pattern;
use kumiki::{Blueprint, Inputs, Outputs, RunConfig, Submitter, TaskNode, discover};

#[derive(Parser, Debug)]
#[command(version, about = "Example BIDS app with participant and group analysis")]
struct Args {
    /// Directory with the input dataset formatted according to the BIDS standard.
    bids_dir: Utf8PathBuf,
    /// Directory the participant level masks are written to.
    output_dir: Utf8PathBuf,
    /// Voxels (bytes) below this value are masked out.
    #[arg(long, default_value_t = 16)]
    threshold: u8,
}

fn mask_name(t1_file: &Utf8Path) -> anyhow::Result<String> {
    let name = t1_file
        .file_name()
        .with_context(|| format!("{t1_file} has no file name"))?;

    Ok(name
        .replace("_T1w", "_brain")
        .replace(".gz", "")
        .replace(".nii", ""))
}

fn extract_brain(inputs: &Inputs) -> anyhow::Result<Outputs> {
    let t1_file = Utf8PathBuf::from(inputs.str("t1_file")?);
    let output_dir = Utf8PathBuf::from(inputs.str("output_dir")?);
    let threshold: u8 = inputs.get("threshold")?;

    let mut data = std::fs::read(&t1_file).with_context(|| format!("Couldn't read {t1_file}"))?;
    for voxel in &mut data {
        if *voxel < threshold {
            *voxel = 0;
        }
    }

    let mask = output_dir.join(mask_name(&t1_file)?);
    std::fs::write(&mask, data).with_context(|| format!("Couldn't write {mask}"))?;

    Ok(Outputs::new().with("mask", mask.as_str()))
}

fn group_analysis(inputs: &Inputs) -> anyhow::Result<Outputs> {
    let masks: Vec<String> = inputs.get("masks")?;
    anyhow::ensure!(!masks.is_empty(), "no participant masks to analyze");

    let mut sizes = Vec::with_capacity(masks.len());
    for mask in &masks {
        let data = std::fs::read(mask).with_context(|| format!("Couldn't read {mask}"))?;
        sizes.push(data.iter().filter(|&&voxel| voxel != 0).count());
    }

    let mean = sizes.iter().sum::<usize>() as f64 / sizes.len() as f64;

    Ok(Outputs::new()
        .with("mean", mean)
        .try_with("sizes", &sizes)?)
}

fn find_t1_files(bids_dir: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    let root = Pattern::escape(bids_dir.as_str());

    let mut files = discover::glob_paths(&format!("{root}/sub-*/anat/*_T1w.nii*"))?;
    files.extend(discover::glob_paths(&format!(
        "{root}/sub-*/ses-*/anat/*_T1w.nii*"
    ))?);
    files.sort();

    Ok(files)
}

fn main() -> anyhow::Result<()> {
    kumiki::init_logging()?;

    let args = Args::parse();
    std::fs::create_dir_all(&args.output_dir)?;

    let t1_files = find_t1_files(&args.bids_dir)?;
    tracing::info!("Found {} T1 file(s) in {}", t1_files.len(), args.bids_dir);

    let mut blueprint = Blueprint::new();
    let files = blueprint.split("t1_file", t1_files.iter().map(|path| path.as_str()))?;

    let brain = blueprint.add_node(
        TaskNode::builder("extract_brain")
            .input("t1_file", &files)
            .input("output_dir", args.output_dir.as_path())
            .input("threshold", u32::from(args.threshold))
            .track_file("t1_file")
            .identify_by("t1_file")
            .output("mask")
            .run(extract_brain),
    )?;

    blueprint.combine("t1_file")?;

    let group = blueprint.add_node(
        TaskNode::builder("group_analysis")
            .input("masks", brain.out("mask"))
            .track_file("masks")
            .outputs(["mean", "sizes"])
            .run(group_analysis),
    )?;

    let workflow = blueprint.finalize([
        ("masks", brain.out("mask")),
        ("mean", group.out("mean")),
    ])?;

    let config = RunConfig::default()
        .cache_dir(args.output_dir.join(".kumiki"))
        .label("group_analysis")
        .output_dir(&args.output_dir);

    let outcome = Submitter::new(config)?.run(&workflow)?;

    if let Some(mean) = outcome.get("mean") {
        println!("Group analysis result: {mean}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_name() {
        assert_eq!(
            mask_name(Utf8Path::new("/bids/sub-01/anat/sub-01_T1w.nii.gz")).unwrap(),
            "sub-01_brain"
        );
    }
}
