//! `discover` — print the pools the manifest resolves to.

use std::path::Path;

use anyhow::Context;
use clap::ValueEnum;

use cgipool_core::{Manifest, PoolConfig, SkippedSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Text,
    Json,
}

pub fn run(manifest: &Path, build_dir: &Path, format: Format) -> anyhow::Result<()> {
    let manifest_data = Manifest::from_file(manifest)
        .with_context(|| format!("loading manifest {}", manifest.display()))?;
    let (pools, skipped) = manifest_data.pool_configs(build_dir, Path::exists);
    print!("{}", render(&pools, &skipped, format)?);
    Ok(())
}

fn render(
    pools: &[PoolConfig],
    skipped: &[SkippedSample],
    format: Format,
) -> anyhow::Result<String> {
    match format {
        Format::Json => {
            let value = serde_json::json!({
                "pools": pools,
                "skipped": skipped
                    .iter()
                    .map(|s| serde_json::json!({"name": s.name, "reason": s.reason}))
                    .collect::<Vec<_>>(),
            });
            Ok(serde_json::to_string_pretty(&value)? + "\n")
        }
        Format::Text => {
            let mut out = String::new();
            for pool in pools {
                out.push_str(&format!(
                    "{:<24} min={} max={} ports={}+  {}\n",
                    pool.name,
                    pool.min,
                    pool.max,
                    pool.base_port,
                    pool.command.display_for_port(pool.base_port),
                ));
            }
            for sample in skipped {
                out.push_str(&format!("skipped {}: {}\n", sample.name, sample.reason));
            }
            Ok(out)
        }
    }
}
