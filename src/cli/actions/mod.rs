pub mod run;

use secrecy::SecretString;
use std::{collections::HashMap, time::Duration};

#[derive(Debug)]
pub enum Action {
    Run {
        dsn: SecretString,
        listen: String,
        scrape_interval: Duration,
        labels: HashMap<String, String>,
    },
}
