use crate::config::{local_hostname, Config};
use crate::error::Result;
use crate::forward::build_outbound_client;
use crate::state::load_authority;
use crate::tls::upstream;
use std::path::Path;
use tracing::{info, warn};

fn ca_common_name(config: &Config) -> String {
    config
        .tls
        .ca_common_name
        .clone()
        .unwrap_or_else(local_hostname)
}

pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    info!("  Proxy listener: {}", config.proxy.bind_addr());
    if config.admin.enabled {
        info!("  Admin API: {}", config.admin.bind_addr());
    } else {
        info!("  Admin API: DISABLED");
    }
    info!(
        "  TLS interception: {}",
        if config.tls.intercept { "enabled" } else { "blind tunnels" }
    );

    let ca = load_authority(&config, &ca_common_name(&config))?;
    info!("✓ Certificate authority '{}' valid until {}", ca.common_name(), ca.not_after());

    upstream::client_config(&config.upstream)?;
    if config.upstream.accept_invalid_certs {
        warn!("  ! Upstream certificate verification is disabled");
    }
    info!(
        "✓ Upstream trust store ready ({} extra root file(s))",
        config.upstream.extra_root_certs.len()
    );

    build_outbound_client(&config.upstream)?;
    info!("✓ Outbound client ready");

    if config.capture.enabled {
        info!(
            "  Capture: {:?} backend, id header '{}', {} day retention",
            config.capture.backend, config.capture.id_header, config.capture.retention_days
        );
    } else {
        info!("  Capture: DISABLED");
    }

    info!("\n✓ All checks passed");
    Ok(())
}

/// Prints the root certificate, or writes it to `out`.
pub async fn export_ca(config: Config, out: Option<&Path>) -> Result<()> {
    let ca = load_authority(&config, &ca_common_name(&config))?;

    match out {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            tokio::fs::write(path, ca.root_pem()).await?;
            info!("Wrote root certificate to {}", path.display());
        }
        None => print!("{}", ca.root_pem()),
    }
    Ok(())
}
