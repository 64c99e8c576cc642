#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = find_config_file()?;
    let config_content = std::fs::read_to_string(&config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read config from {}: {}",
            config_path.display(),
            e
        )
    })?;
    let controller = silo::controller::Controller::from_ron(&config_content)?;

    controller.run().await
}

/// Find the configuration file using the following precedence:
/// 1. `SILO_CONFIG` environment variable
/// 2. ./silo.config.ron (current working directory)
/// 3. /etc/silo/silo.config.ron (system-wide config)
fn find_config_file() -> anyhow::Result<std::path::PathBuf> {
    if let Ok(env_path) = std::env::var("SILO_CONFIG") {
        let path = std::path::PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("SILO_CONFIG points to non-existent file: {}", path.display());
    }

    let default_paths = [
        std::path::PathBuf::from("./silo.config.ron"),
        std::path::PathBuf::from("/etc/silo/silo.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|p| p.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - SILO_CONFIG environment variable\n{paths_tried}"
    )
}
