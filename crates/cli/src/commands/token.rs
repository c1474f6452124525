//! `token` command implementation.

use anyhow::{Context, Result};
use contracts::{Token, TOKEN_SIZE};
use serde::Serialize;

use crate::cli::TokenArgs;

/// Decoded token for JSON output
#[derive(Serialize)]
struct TokenInfo {
    token: String,
    stream_id: u64,
    endpoint: String,
    address_family: &'static str,
    bytes: String,
}

impl From<&Token> for TokenInfo {
    fn from(token: &Token) -> Self {
        let endpoint = token.endpoint();
        Self {
            token: token.encode(),
            stream_id: token.stream_id(),
            endpoint: endpoint.to_string(),
            address_family: if endpoint.is_ipv4() { "ipv4" } else { "ipv6" },
            bytes: token
                .to_bytes()
                .iter()
                .map(|b| format!("{b:02x}"))
                .collect(),
        }
    }
}

/// Execute the `token` command
pub fn run_token(args: &TokenArgs) -> Result<()> {
    let token = Token::decode(args.token.trim()).context("Failed to decode token")?;
    let info = TokenInfo::from(&token);

    if args.json {
        let json = serde_json::to_string_pretty(&info).context("Failed to serialize token")?;
        println!("{json}");
    } else {
        println!("Stream id: {}", info.stream_id);
        println!("Endpoint: {} ({})", info.endpoint, info.address_family);
        println!("Bytes ({TOKEN_SIZE}): {}", info.bytes);
    }
    Ok(())
}
