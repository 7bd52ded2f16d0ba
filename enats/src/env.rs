use crate::{Error, Result};
use std::env;
use std::str::FromStr;

static ENATS_CONFIG: &'static str = "ENATS_CONFIG";
static ENATS_HOST: &'static str = "ENATS_HOST";
static ENATS_READY_TIMEOUT_MS: &'static str = "ENATS_READY_TIMEOUT_MS";
static ENATS_MAX_PAYLOAD: &'static str = "ENATS_MAX_PAYLOAD";
static ENATS_SERVER_NAME: &'static str = "ENATS_SERVER_NAME";

// Unset and empty are both treated as "not configured".
fn get(var: &str) -> Option<String> {
    match env::var(var) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}

fn parse<T: FromStr>(var: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match get(var) {
        Some(val) => match val.trim().parse::<T>() {
            Ok(v) => Ok(Some(v)),
            Err(err) => Err(Error::Config(format!("{}={:?}: {}", var, val, err))),
        },
        None => Ok(None),
    }
}

/// Returns the `ENATS_CONFIG` env variable: a path to a TOML config file
pub fn enats_config() -> Option<String> {
    get(ENATS_CONFIG)
}

// Sets the ENATS_CONFIG env variable
pub fn set_enats_config(path: String) {
    env::set_var(ENATS_CONFIG, path);
}

/// Returns the `ENATS_HOST` env variable
pub fn enats_host() -> Option<String> {
    get(ENATS_HOST)
}

// Sets the ENATS_HOST env variable
pub fn set_enats_host(host: String) {
    env::set_var(ENATS_HOST, host);
}

/// Returns the `ENATS_READY_TIMEOUT_MS` env variable
pub fn enats_ready_timeout_ms() -> Result<Option<u64>> {
    parse(ENATS_READY_TIMEOUT_MS)
}

// Sets the ENATS_READY_TIMEOUT_MS env variable
pub fn set_enats_ready_timeout_ms(ms: u64) {
    env::set_var(ENATS_READY_TIMEOUT_MS, ms.to_string());
}

/// Returns the `ENATS_MAX_PAYLOAD` env variable
pub fn enats_max_payload() -> Result<Option<usize>> {
    parse(ENATS_MAX_PAYLOAD)
}

// Sets the ENATS_MAX_PAYLOAD env variable
pub fn set_enats_max_payload(bytes: usize) {
    env::set_var(ENATS_MAX_PAYLOAD, bytes.to_string());
}

/// Returns the `ENATS_SERVER_NAME` env variable
pub fn enats_server_name() -> Option<String> {
    get(ENATS_SERVER_NAME)
}

// Sets the ENATS_SERVER_NAME env variable
pub fn set_enats_server_name(name: String) {
    env::set_var(ENATS_SERVER_NAME, name);
}
