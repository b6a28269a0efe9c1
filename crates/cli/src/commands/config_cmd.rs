//! `skein config`: configuration management commands.

use skein_config::AppConfig;

pub async fn default() -> Result<(), Box<dyn std::error::Error>> {
    print!("{}", AppConfig::default_toml());
    Ok(())
}

pub async fn validate() -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    match AppConfig::load() {
        Ok(config) => {
            println!("   Config parsed and validated");

            let mut warnings = Vec::new();
            if config.run_store.base_url.is_none() {
                warnings.push("No run store configured; run history is not persisted");
            }
            if config.runs.run_timeout_secs > 3600 {
                warnings.push("Sub-agent timeout above one hour");
            }
            if config.transport.head_chars + config.transport.tail_chars
                > config.transport.context_window
            {
                warnings.push("Truncation head + tail exceed the context window");
            }

            for w in &warnings {
                println!("   warning: {w}");
            }

            println!();
            println!("   Model:       {}", config.model.name);
            println!("   Max runs:    {}", config.runs.max_children);
            println!("   Max depth:   {}", config.runs.max_spawn_depth);
        }
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    }

    Ok(())
}

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use skein_config::AppConfig;

    #[test]
    fn config_path_is_valid() {
        let path = AppConfig::config_dir().join("config.toml");
        assert!(path.ends_with(".skein/config.toml"));
    }

    #[test]
    fn default_toml_parses_back() {
        let parsed: AppConfig = toml::from_str(&AppConfig::default_toml()).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.runs.max_children, AppConfig::default().runs.max_children);
    }
}
