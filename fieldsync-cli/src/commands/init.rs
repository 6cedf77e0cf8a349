//! `fieldsync init --site <id> [--remote <url>]`

use anyhow::{Context, Result};
use clap::Args;

use fieldsync_core::{config, SiteId};

use super::home_dir;

/// Provision this device for a site.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Site whose reference data pack this device installs.
    #[arg(long, short = 's')]
    pub site: String,

    /// Base URL of the remote document endpoint. Omit to run against the
    /// in-process remote.
    #[arg(long, short = 'r', value_name = "URL")]
    pub remote: Option<String>,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        let site = self.site.clone();
        let device = config::init_at(&home, SiteId::from(self.site), self.remote)
            .with_context(|| format!("failed to provision device for site '{site}'"))?;

        println!("✓ Device provisioned for site '{site}'");
        match device.remote_url.as_deref() {
            Some(url) => println!("  Remote:   {url}"),
            None => println!("  Remote:   in-process (no --remote given)"),
        }
        println!("  Saved to: {}", config::config_path_at(&home).display());
        Ok(())
    }
}
