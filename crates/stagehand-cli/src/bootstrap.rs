use anyhow::{anyhow, Context, Result};
use stagehand_core::{InstallLayout, Manifest, Settings};
use stagehand_download::Client;

/// Resolve the manifest from its configured source: a remote document
/// fetched through the downloader, or the bootstrap section embedded in the
/// managed configuration.
pub fn load_manifest(
    settings: &Settings,
    embedded: Option<Manifest>,
    client: &Client,
) -> Result<Manifest> {
    if let Some(url) = &settings.json_url {
        tracing::info!(url, "loading bootstrap manifest from remote document");
        let layout = InstallLayout::new(&settings.install_path);
        layout.ensure_base_dirs()?;
        let destination = layout.manifest_path();
        client
            .fetch(
                url,
                &destination,
                None,
                settings.max_retries,
                settings.retry_delay(),
            )
            .with_context(|| format!("failed to download bootstrap manifest from {url}"))?;
        return Manifest::load(&destination, !settings.skip_validation);
    }

    if let Some(manifest) = embedded {
        tracing::info!("loading bootstrap manifest from managed configuration");
        if !settings.skip_validation {
            manifest.validate()?;
        }
        return Ok(manifest);
    }

    Err(anyhow!(
        "no bootstrap source configured; pass --jsonurl or deploy a managed bootstrap section"
    ))
}
