//! Join token formatting.
//!
//! Agents pin the cluster CA through the token: `K10<sha256(ca)>::<creds>`,
//! where `creds` is `server:<token>` unless the token already names a user.

use crate::error::ProvisionError;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

const TOKEN_PREFIX: &str = "K10";
const SERVER_USER: &str = "server";

/// Build the full agent token from the raw server token and the CA bundle.
///
/// Tokens that are already full (`K10...`) are returned as they are.
pub fn format_token(token: &str, ca_path: &Path) -> Result<String, ProvisionError> {
    if token.is_empty() {
        return Err(ProvisionError::MissingServerToken);
    }
    if token.starts_with(TOKEN_PREFIX) {
        return Ok(token.to_string());
    }

    let ca = std::fs::read(ca_path)?;
    Ok(format_token_with_ca(token, &ca))
}

/// Same as [`format_token`] with the CA bundle already in memory.
pub fn format_token_with_ca(token: &str, ca: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(ca));
    let creds = if token.contains(':') {
        token.to_string()
    } else {
        format!("{}:{}", SERVER_USER, token)
    };
    format!("{}{}::{}", TOKEN_PREFIX, digest, creds)
}

/// Command an operator runs on another host to join it as an agent.
pub fn join_command(program: &str, advertise_ip: IpAddr, supervisor_port: u16, token: &str) -> String {
    format!(
        "{} agent -s https://{} -t {}",
        program,
        SocketAddr::new(advertise_ip, supervisor_port),
        token
    )
}
