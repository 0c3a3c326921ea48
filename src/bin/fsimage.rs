use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use fsimage::source::{directory_content_size, populate_from_directory};
use fsimage::{create_builder, BuildOptions, FsType, ImageManifest};
use sha2::{Digest, Sha256};

fn usage() -> &'static str {
    "Usage:\n  fsimage [-v] build <manifest.toml> <output>\n  fsimage [-v] import <ext2|squashfs|cpio> <source_dir> <output>"
}

fn main() -> Result<()> {
    let mut verbose = false;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| {
            let flag = arg == "-v" || arg == "--verbose";
            verbose |= flag;
            !flag
        })
        .collect();

    env_logger::Builder::new()
        .filter_level(if verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    match args.as_slice() {
        [build, manifest, output] if build == "build" => {
            build_from_manifest(Path::new(manifest), Path::new(output))
        }
        [import, format, source_dir, output] if import == "import" => {
            import_directory(format, Path::new(source_dir), Path::new(output))
        }
        _ => bail!(usage()),
    }
}

fn build_from_manifest(manifest_path: &Path, output: &Path) -> Result<()> {
    let manifest = ImageManifest::load(manifest_path)?;
    let image = manifest.build_image().with_context(|| {
        format!(
            "building {} image from '{}'",
            manifest.fs_type,
            manifest_path.display()
        )
    })?;
    write_image(&image, output)
}

fn import_directory(format: &str, source_dir: &Path, output: &Path) -> Result<()> {
    let fs_type: FsType = format
        .parse()
        .with_context(|| format!("invalid image format '{format}'"))?;
    let content_size = directory_content_size(source_dir)?;
    let mut builder = create_builder(fs_type, &BuildOptions::default(), content_size)?;
    populate_from_directory(builder.as_mut(), source_dir)?;
    let image = builder.get_filesystem_image().with_context(|| {
        format!(
            "building {fs_type} image from '{}'",
            source_dir.display()
        )
    })?;
    write_image(&image, output)
}

fn write_image(image: &[u8], output: &Path) -> Result<()> {
    fs::write(output, image).with_context(|| format!("writing image '{}'", output.display()))?;
    let sha = format!("{:x}", Sha256::digest(image));
    println!("{sha}  {} ({} bytes)", output.display(), image.len());
    Ok(())
}
