//! `skein runs`: print the process-wide run registry summary.

use skein_agent::runs::{global, reset_global, RunRegistry, RunSpec};
use skein_core::error::RunError;

pub async fn run(demo: bool) -> Result<(), Box<dyn std::error::Error>> {
    let registry = global();
    if demo {
        seed_demo(&registry)?;
    }
    println!("{}", serde_json::to_string_pretty(&registry.summary())?);
    reset_global();
    Ok(())
}

/// One run in each status: a finished crawl, a failed build, a live search.
fn seed_demo(registry: &RunRegistry) -> Result<(), RunError> {
    let crawl = RunSpec::new("crawler", "Collect the changelog pages");
    let build = RunSpec::new("builder", "Build the release notes");
    let search = RunSpec::new("searcher", "Find open issues about retries");
    let (crawl_id, build_id) = (crawl.run_id.clone(), build.run_id.clone());

    registry.register(crawl)?;
    registry.register(build)?;
    registry.register(search)?;

    registry.complete(&crawl_id, "12 pages collected");
    registry.fail(&build_id, "template missing");
    tracing::debug!("Demo runs registered");
    Ok(())
}
