//! Unverified parsing of the Bedrock login connection request.
//!
//! The proxy only needs the player's display name and the address they typed,
//! so token signatures are not checked. The backend performs authentication.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;

use super::{CodecError, Reader};

const MAX_SECTION_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityData {
    pub display_name: String,
    pub identity: Option<String>,
    pub xuid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientData {
    pub server_address: String,
}

#[derive(Deserialize)]
struct Chain {
    #[serde(default)]
    chain: Vec<String>,
    /// Newer clients nest the chain as a JSON string.
    #[serde(rename = "Certificate", default)]
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct ChainClaims {
    #[serde(rename = "extraData")]
    extra_data: Option<ExtraData>,
}

#[derive(Deserialize)]
struct ExtraData {
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(default)]
    identity: Option<String>,
    #[serde(rename = "XUID", default)]
    xuid: Option<String>,
}

#[derive(Deserialize)]
struct ClientClaims {
    #[serde(rename = "ServerAddress", default)]
    server_address: String,
}

fn invalid(msg: impl Into<String>) -> CodecError {
    CodecError::InvalidLogin(msg.into())
}

fn read_section<'a>(r: &mut Reader<'a>) -> Result<&'a [u8], CodecError> {
    let len = r.read_i32_le()?;
    if len < 0 || len as usize > MAX_SECTION_LEN {
        return Err(invalid(format!("section length {len} out of range")));
    }
    r.read_bytes(len as usize)
}

/// Decodes the claims segment of a JWT without checking its signature.
fn jwt_claims<T: for<'de> Deserialize<'de>>(token: &str) -> Result<T, CodecError> {
    let mut parts = token.split('.');
    let (Some(_), Some(payload), Some(_)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid("token is not a JWT"));
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| invalid(format!("token payload: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| invalid(format!("token claims: {e}")))
}

fn chain_tokens(raw: &[u8]) -> Result<Vec<String>, CodecError> {
    let chain: Chain =
        serde_json::from_slice(raw).map_err(|e| invalid(format!("chain: {e}")))?;
    if !chain.chain.is_empty() {
        return Ok(chain.chain);
    }
    match chain.certificate {
        Some(cert) => {
            let inner: Chain = serde_json::from_str(&cert)
                .map_err(|e| invalid(format!("certificate: {e}")))?;
            Ok(inner.chain)
        }
        None => Err(invalid("empty chain")),
    }
}

/// Extracts identity and client data from a login connection request.
pub fn parse(request: &[u8]) -> Result<(IdentityData, ClientData), CodecError> {
    let mut r = Reader::new(request);
    let chain = read_section(&mut r)?;
    let client = read_section(&mut r)?;

    let mut identity = None;
    for token in chain_tokens(chain)? {
        let claims: ChainClaims = jwt_claims(&token)?;
        if let Some(extra) = claims.extra_data {
            identity = Some(IdentityData {
                display_name: extra.display_name,
                identity: extra.identity,
                xuid: extra.xuid,
            });
        }
    }
    let identity = identity.ok_or_else(|| invalid("no identity in chain"))?;

    let client = std::str::from_utf8(client).map_err(|e| invalid(e.to_string()))?;
    let claims: ClientClaims = jwt_claims(client.trim())?;

    Ok((
        identity,
        ClientData {
            server_address: claims.server_address,
        },
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{body}.c2ln")
    }

    /// Builds a connection request the way a Bedrock client lays it out.
    pub(crate) fn connection_request(name: &str, server_address: &str) -> Vec<u8> {
        let chain = serde_json::json!({
            "chain": [
                jwt(serde_json::json!({"certificateAuthority": true})),
                jwt(serde_json::json!({"extraData": {"displayName": name, "XUID": "123"}})),
            ]
        })
        .to_string();
        let client = jwt(serde_json::json!({"ServerAddress": server_address}));

        let mut out = Vec::new();
        out.extend_from_slice(&(chain.len() as i32).to_le_bytes());
        out.extend_from_slice(chain.as_bytes());
        out.extend_from_slice(&(client.len() as i32).to_le_bytes());
        out.extend_from_slice(client.as_bytes());
        out
    }

    #[test]
    fn extracts_display_name_and_server_address() {
        let req = connection_request("Steve", "bedrock.example.com:19132");
        let (id, client) = parse(&req).unwrap();
        assert_eq!(id.display_name, "Steve");
        assert_eq!(id.xuid.as_deref(), Some("123"));
        assert_eq!(client.server_address, "bedrock.example.com:19132");
    }

    #[test]
    fn nested_certificate_chain_is_accepted() {
        let inner = serde_json::json!({
            "chain": [jwt(serde_json::json!({"extraData": {"displayName": "Alex"}}))]
        })
        .to_string();
        let chain = serde_json::json!({"AuthenticationType": 0, "Certificate": inner}).to_string();
        let client = jwt(serde_json::json!({"ServerAddress": "a.b"}));
        let mut req = Vec::new();
        req.extend_from_slice(&(chain.len() as i32).to_le_bytes());
        req.extend_from_slice(chain.as_bytes());
        req.extend_from_slice(&(client.len() as i32).to_le_bytes());
        req.extend_from_slice(client.as_bytes());

        let (id, client) = parse(&req).unwrap();
        assert_eq!(id.display_name, "Alex");
        assert_eq!(client.server_address, "a.b");
    }

    #[test]
    fn garbage_is_invalid_login() {
        let mut req = Vec::new();
        req.extend_from_slice(&4i32.to_le_bytes());
        req.extend_from_slice(b"nope");
        req.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(parse(&req), Err(CodecError::InvalidLogin(_))));
        assert!(matches!(
            parse(&(-1i32).to_le_bytes()),
            Err(CodecError::InvalidLogin(_))
        ));
    }
}
