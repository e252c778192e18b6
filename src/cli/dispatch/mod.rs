use crate::cli::actions::Action;
use anyhow::{Result, anyhow};
use secrecy::SecretString;
use std::{collections::HashMap, time::Duration};

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let dsn = matches
        .get_one::<String>("dsn")
        .map(String::to_string)
        .ok_or_else(|| anyhow!("DSN is required, pass it as an argument or via the DSN env var"))?;

    let labels = matches
        .get_many::<String>("label")
        .into_iter()
        .flatten()
        .map(|raw| parse_label(raw))
        .collect::<Result<HashMap<_, _>>>()?;

    Ok(Action::Run {
        dsn: SecretString::from(dsn),
        listen: matches
            .get_one::<String>("listen")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0:80".to_string()),
        scrape_interval: matches
            .get_one::<Duration>("scrape-interval")
            .copied()
            .unwrap_or(Duration::from_secs(15)),
        labels,
    })
}

fn parse_label(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid label {raw:?}, expected key=value"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("invalid label {raw:?}, empty key"));
    }
    Ok((key.to_string(), value.trim().to_string()))
}
