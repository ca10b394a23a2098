use anyhow::{bail, Context, Result};
use clap::Subcommand;
use claws_gateway::{FileSettings, SettingsStore};
use url::Url;

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum ConfigCommand {
    /// Print the settings file location and the effective endpoint
    Show,
    /// Write --url and/or --token into the settings file
    Set,
}

pub fn run(
    action: ConfigCommand,
    store: &FileSettings,
    url: Option<String>,
    token: Option<String>,
) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            let stored = store.read_file();
            let effective = store
                .load()
                .resolve()
                .context("default gateway url is invalid")?;
            println!("settings: {}", store.path().display());
            println!(
                "ws_url:   {} (file: {})",
                effective.url,
                stored.ws_url.as_deref().unwrap_or("-")
            );
            println!("token:    {}", mask_token(&effective.token));
            Ok(())
        }
        ConfigCommand::Set => {
            if url.is_none() && token.is_none() {
                bail!("nothing to set: pass --url and/or --token");
            }
            let mut stored = store.read_file();
            if let Some(url) = url {
                Url::parse(&url).with_context(|| format!("invalid gateway url: {url}"))?;
                stored.ws_url = Some(url);
            }
            if let Some(token) = token {
                stored.token = Some(token);
            }
            store
                .save(&stored)
                .with_context(|| format!("failed to write {}", store.path().display()))?;
            println!("Saved {}", store.path().display());
            Ok(())
        }
    }
}

fn mask_token(token: &str) -> String {
    if token.is_empty() {
        return "(none)".to_string();
    }
    let visible: String = token.chars().take(4).collect();
    if visible.len() == token.len() {
        "****".to_string()
    } else {
        format!("{visible}****")
    }
}
