//! Validated mining configuration.
//!
//! Mirrors the teacher's `MiningConfig`/`SessionConfig` shape but widens it to
//! the full field set a heterogeneous backend set needs, and adds the
//! validation the teacher left to individual adapters.

use crate::{BackendError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

const MAX_POOL_LEN: usize = 256;
const MAX_WALLET_LEN: usize = 256;
const ALLOWED_POOL_SCHEMES: &[&str] = &["stratum://", "stratum+tcp://", "stratum+ssl://"];

fn instance_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

fn extra_arg_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.=:/-]+$").unwrap())
}

fn shell_metachar_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[;&|`$(){}<>\\\n\r"']"#).unwrap())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // connection
    pub pool: String,
    pub wallet: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub rig_id: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub tls: bool,

    // algorithm
    pub algo: String,
    pub coin: String,

    // cpu
    #[serde(default)]
    pub threads: u32,
    #[serde(default)]
    pub intensity: u8,
    #[serde(default)]
    pub cpu_affinity: Option<u64>,
    #[serde(default)]
    pub cpu_priority: u8,
    #[serde(default)]
    pub huge_pages: bool,
    #[serde(default)]
    pub donate_level: u8,

    // gpu
    #[serde(default)]
    pub gpu_devices: Vec<u32>,
    #[serde(default)]
    pub gpu_intensity: Vec<u8>,

    // extra
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Config {
    /// Validates every invariant in spec §3. Called before a backend ever
    /// sees the config, so `build_args` can assume a clean value.
    pub fn validate(&self) -> Result<()> {
        if self.pool.is_empty() {
            return Err(BackendError::Validation("pool is required".into()));
        }
        if self.pool.len() > MAX_POOL_LEN {
            return Err(BackendError::Validation("pool exceeds max length".into()));
        }
        if !ALLOWED_POOL_SCHEMES.iter().any(|s| self.pool.starts_with(s)) {
            return Err(BackendError::Validation(format!(
                "pool scheme must be one of {:?}",
                ALLOWED_POOL_SCHEMES
            )));
        }
        reject_shell_metachars("pool", &self.pool)?;

        if self.wallet.is_empty() {
            return Err(BackendError::Validation("wallet is required".into()));
        }
        if self.wallet.len() > MAX_WALLET_LEN {
            return Err(BackendError::Validation("wallet exceeds max length".into()));
        }
        reject_shell_metachars("wallet", &self.wallet)?;
        reject_shell_metachars("password", &self.password)?;
        reject_shell_metachars("rig_id", &self.rig_id)?;
        if let Some(proxy) = &self.proxy {
            reject_shell_metachars("proxy", proxy)?;
        }

        if self.algo.is_empty() {
            return Err(BackendError::Validation("algo is required".into()));
        }
        reject_shell_metachars("algo", &self.algo)?;
        reject_shell_metachars("coin", &self.coin)?;

        if self.intensity > 5 {
            return Err(BackendError::Validation("intensity must be 0..=5".into()));
        }
        if self.cpu_priority > 5 {
            return Err(BackendError::Validation("cpu_priority must be 0..=5".into()));
        }
        if self.donate_level > 99 {
            return Err(BackendError::Validation("donate_level must be 0..=99".into()));
        }

        if let Some(log_file) = &self.log_file {
            if log_file.contains('/') || log_file.contains('\\') || log_file.contains("..") {
                return Err(BackendError::Validation(
                    "log_file must be a bare filename".into(),
                ));
            }
            if !log_file
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
            {
                return Err(BackendError::Validation(
                    "log_file contains disallowed characters".into(),
                ));
            }
        }

        for arg in &self.extra_args {
            if !extra_arg_regex().is_match(arg) {
                return Err(BackendError::Validation(format!(
                    "extra arg {:?} is not allowlisted",
                    arg
                )));
            }
        }

        Ok(())
    }
}

fn reject_shell_metachars(field: &str, value: &str) -> Result<()> {
    if shell_metachar_regex().is_match(value) {
        return Err(BackendError::Validation(format!(
            "{field} contains disallowed characters"
        )));
    }
    Ok(())
}

/// Splits a free-form "additional args" string the way a shell would, but
/// without ever invoking one. Quoted segments are honoured; no globbing, no
/// variable expansion, no redirection.
pub fn split_argv(input: &str) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;

    for c in input.chars() {
        match in_quotes {
            Some(q) if c == q => in_quotes = None,
            Some(_) => current.push(c),
            None => match c {
                '"' | '\'' => in_quotes = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if in_quotes.is_some() {
        return Err(BackendError::Validation("unterminated quote in extra args".into()));
    }
    if !current.is_empty() {
        out.push(current);
    }
    Ok(out)
}

/// Validates a caller-supplied instance-name suffix against spec §3/§4.C:
/// alphanumeric plus `-_`, no path separators, no `..`.
pub fn validate_instance_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains("..") || !instance_name_regex().is_match(name) {
        return Err(BackendError::PathTraversal);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            pool: "stratum+tcp://pool.example.com:3333".into(),
            wallet: "4AxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxW".into(),
            password: "x".into(),
            rig_id: "rig1".into(),
            proxy: None,
            tls: false,
            algo: "rx/0".into(),
            coin: "xmr".into(),
            threads: 0,
            intensity: 3,
            cpu_affinity: None,
            cpu_priority: 2,
            huge_pages: true,
            donate_level: 1,
            gpu_devices: vec![],
            gpu_intensity: vec![],
            log_file: None,
            extra_args: vec![],
        }
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn rejects_disallowed_scheme() {
        let mut c = valid_config();
        c.pool = "http://pool.example.com".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_shell_metachars_in_wallet() {
        let mut c = valid_config();
        c.wallet = "wallet; rm -rf /".into();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_intensity() {
        let mut c = valid_config();
        c.intensity = 9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_path_in_log_file() {
        let mut c = valid_config();
        c.log_file = Some("../../etc/passwd".into());
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_non_allowlisted_extra_arg() {
        let mut c = valid_config();
        c.extra_args = vec!["$(reboot)".into()];
        assert!(c.validate().is_err());
    }

    #[test]
    fn split_argv_honours_quotes() {
        let parts = split_argv(r#"--tag "hello world" --flag"#).unwrap();
        assert_eq!(parts, vec!["--tag", "hello world", "--flag"]);
    }

    #[test]
    fn split_argv_rejects_unterminated_quote() {
        assert!(split_argv(r#"--tag "unterminated"#).is_err());
    }

    #[test]
    fn instance_name_rejects_traversal() {
        assert!(validate_instance_name("../../x").is_err());
        assert!(validate_instance_name("xmrig-rx0").is_ok());
    }
}
