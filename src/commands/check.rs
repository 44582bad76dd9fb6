use anyhow::{Context, Result};

use ticketwatch::config::EngineConfig;

/// Validate the configuration and print what the engine would run with
pub fn check_config(config: &EngineConfig) -> Result<()> {
    config.validate().context("Configuration is invalid")?;

    println!("Configuration OK");
    println!("{:-<40}", "");
    println!(
        "Platforms: {}",
        if config.scheduler.platforms.is_empty() {
            "(from plugins)".to_string()
        } else {
            config.scheduler.platforms.join(", ")
        }
    );
    println!(
        "Workers per platform: {}",
        config.scheduler.workers_per_platform
    );
    println!(
        "Default rate: {}/s (burst {}, max concurrency {})",
        config.admission.default.rate_per_sec,
        config.admission.default.burst,
        config.admission.default.max_concurrency
    );
    for (platform, limits) in &config.admission.platforms {
        println!(
            "  {platform}: {}/s (burst {}, max concurrency {})",
            limits.rate_per_sec, limits.burst, limits.max_concurrency
        );
    }
    println!(
        "Identity disable threshold: {} failures",
        config.pool.disable_threshold
    );
    println!("Configured identities: {}", config.provider.identities.len());
    println!(
        "Cache layers: {}",
        config
            .cache
            .layers
            .iter()
            .map(|l| format!("{} ({}s)", l.name, l.ttl_secs))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!(
        "Monitoring interval: {}s",
        config.scheduler.monitoring_interval_secs
    );
    match &config.storage.snapshot_path {
        Some(path) => println!("Snapshot: {}", path.display()),
        None => println!("Snapshot: disabled"),
    }
    println!("Admin API: {}", config.server.bind_addr()?);

    Ok(())
}
