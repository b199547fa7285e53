//! Fallback credentials from the Docker credential store, used when the
//! `[registry]` config block carries no explicit user and password.

use base64::Engine;
use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::process::Stdio;

#[derive(serde::Deserialize, Debug)]
struct AuthEntry {
    auth: Option<String>,
}

#[derive(serde::Deserialize, Debug)]
struct DockerConfig {
    auths: Option<HashMap<String, AuthEntry>>,
    #[serde(rename = "credsHelpers")]
    creds_helpers: Option<HashMap<String, String>>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("Invalid UTF-8 in credentials: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("HOME is not set: {0}")]
    Home(#[from] env::VarError),
    #[error("Invalid auth format in docker config")]
    InvalidAuth,
    #[error("No credentials found for {0}")]
    NotFound(String),
}

fn docker_config_path() -> Result<PathBuf, LoginError> {
    let home_dir = env::var("HOME")?;
    Ok(PathBuf::from(home_dir).join(".docker").join("config.json"))
}

fn read_docker_config() -> Result<DockerConfig, LoginError> {
    let file = BufReader::new(File::open(docker_config_path()?)?);
    Ok(serde_json::from_reader(file)?)
}

#[derive(serde::Deserialize)]
struct CredStoreOutput {
    #[serde(rename = "Username")]
    username: String,
    #[serde(rename = "Secret")]
    secret: String,
}

fn call_credential_helper(helper: &str, registry: &str) -> Result<(String, String), LoginError> {
    let command = format!("docker-credential-{}", helper);
    let mut process = Command::new(command)
        .arg("get")
        .stderr(Stdio::piped())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = process.stdin.take() {
        stdin.write_all(registry.as_bytes())?;
    }

    let output = process.wait_with_output()?;
    let output_str = String::from_utf8(output.stdout)?;

    let creds: CredStoreOutput = serde_json::from_str(&output_str)?;
    Ok((creds.username, creds.secret))
}

fn decode_auth(auth: &str) -> Result<(String, String), LoginError> {
    let decoded = base64::prelude::BASE64_STANDARD.decode(auth)?;
    let decoded_str = String::from_utf8(decoded)?;

    match decoded_str.split_once(':') {
        Some((user, password)) if !user.is_empty() => {
            Ok((user.to_string(), password.to_string()))
        }
        _ => Err(LoginError::InvalidAuth),
    }
}

/// Look up credentials for a registry the way the docker CLI does:
/// per-registry helper, then the global store, then inline base64 auths.
pub fn get_docker_credentials(registry: &str) -> Result<(String, String), LoginError> {
    let config = read_docker_config()?;

    if let Some(cred_helpers) = config.creds_helpers {
        if let Some(helper) = cred_helpers.get(registry) {
            return call_credential_helper(helper, registry);
        }
    }

    if let Some(helper) = config.creds_store {
        return call_credential_helper(&helper, registry);
    }

    if let Some(auths) = config.auths {
        if let Some(auth_entry) = auths.get(registry) {
            if let Some(auth) = auth_entry.auth.as_ref() {
                return decode_auth(auth);
            }
        }
    }

    Err(LoginError::NotFound(registry.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn test_decode_auth() {
        let auth = base64::prelude::BASE64_STANDARD.encode("robot:s3cret");
        assert_eq!(
            decode_auth(&auth).unwrap(),
            ("robot".to_string(), "s3cret".to_string())
        );
    }

    #[test]
    fn test_decode_auth_password_with_colon() {
        let auth = base64::prelude::BASE64_STANDARD.encode("robot:s3:cret");
        assert_eq!(
            decode_auth(&auth).unwrap(),
            ("robot".to_string(), "s3:cret".to_string())
        );
    }

    #[test]
    fn test_decode_auth_invalid() {
        let auth = base64::prelude::BASE64_STANDARD.encode("no-separator");
        assert!(matches!(decode_auth(&auth), Err(LoginError::InvalidAuth)));
    }
}
