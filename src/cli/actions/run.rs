use crate::cli::actions::Action;
use crate::exporter;
use anyhow::Result;

/// Handle the run action
///
/// # Errors
///
/// Returns an error if the agent fails to start
pub async fn handle(action: Action) -> Result<()> {
    match action {
        Action::Run {
            dsn,
            listen,
            scrape_interval,
            labels,
        } => {
            exporter::new(dsn, listen, scrape_interval, labels).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handle_rejects_invalid_dsn() {
        // An invalid DSN fails during pool construction, before the
        // blocking HTTP server starts, so the test completes.
        let action = Action::Run {
            dsn: SecretString::from("not-a-dsn".to_string()),
            listen: "127.0.0.1:0".to_string(),
            scrape_interval: Duration::from_secs(15),
            labels: HashMap::new(),
        };

        let result = handle(action).await;

        assert!(result.is_err(), "should fail with an invalid DSN");
    }

    #[test]
    fn test_action_creation() {
        let action = Action::Run {
            dsn: SecretString::from("postgresql://user@host/db".to_string()),
            listen: "0.0.0.0:80".to_string(),
            scrape_interval: Duration::from_secs(30),
            labels: HashMap::from([("cluster".to_string(), "prod".to_string())]),
        };

        match action {
            Action::Run {
                listen,
                scrape_interval,
                labels,
                ..
            } => {
                assert_eq!(listen, "0.0.0.0:80");
                assert_eq!(scrape_interval, Duration::from_secs(30));
                assert_eq!(labels.get("cluster").map(String::as_str), Some("prod"));
            }
        }
    }
}
