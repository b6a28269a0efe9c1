//! `skein status`: show the effective configuration.

use skein_agent::TruncationPolicy;
use skein_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let runs = &config.runs;
    let ld = &config.loop_detection;

    println!("Skein Status");
    println!("============");
    println!("  Config dir:      {}", AppConfig::config_dir().display());
    println!("  Model:           {}", config.model.name);
    println!(
        "  Sub-agents:      max {} per parent, depth {}, timeout {}s",
        runs.max_children, runs.max_spawn_depth, runs.run_timeout_secs
    );
    println!(
        "  Run retention:   {}s (sweep every {}s)",
        runs.retention_secs, runs.sweep_interval_secs
    );
    println!(
        "  Loop detection:  window {}, repeat {}, ping-pong {}, breaker {}",
        ld.window_size, ld.repeat_no_progress, ld.ping_pong_pairs, ld.global_breaker
    );
    println!(
        "  Retry:           {} attempts, {}ms base delay",
        config.retry.max_attempts, config.retry.base_delay_ms
    );
    println!(
        "  Tool results:    {} chars max ({} token window)",
        TruncationPolicy::from(&config.transport).max_chars,
        config.transport.context_window
    );
    println!(
        "  Run store:       {}",
        config.run_store.base_url.as_deref().unwrap_or("disabled")
    );

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("\n  Config file found");
    } else {
        println!("\n  No config file, using defaults (see `skein config`)");
    }

    Ok(())
}
