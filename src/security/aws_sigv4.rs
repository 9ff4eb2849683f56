//! SigV4 presigning for AWS IoT websocket connections.
//!
//! Devices authenticating with access keys connect to
//! `wss://<endpoint>/mqtt` with the signature carried in the query string.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Result, SenderError};

type HmacSha256 = Hmac<Sha256>;

/// Signing name of the AWS IoT data plane.
pub const IOT_SERVICE: &str = "iotdevicegateway";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const CANONICAL_PATH: &str = "/mqtt";

/// Extract the region from an endpoint like `abc-ats.iot.eu-west-1.amazonaws.com`.
pub fn region_from_iot_host(host: &str) -> Option<&str> {
    let labels: Vec<&str> = host.split('.').collect();
    labels
        .iter()
        .position(|label| *label == "iot")
        .and_then(|idx| labels.get(idx + 1))
        .copied()
        .filter(|region| !region.is_empty() && *region != "amazonaws")
}

/// Build a presigned websocket URL for the given endpoint.
pub fn presign_iot_websocket_url(
    protocol: &str,
    host: &str,
    access_key_id: &str,
    secret_key: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let region = region_from_iot_host(host).ok_or_else(|| {
        SenderError::Signing(format!("cannot derive AWS region from host '{}'", host))
    })?;

    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let scope = format!("{}/{}/{}/aws4_request", date_stamp, region, IOT_SERVICE);

    // Parameters must be sorted by name.
    let query = format!(
        "X-Amz-Algorithm={}&X-Amz-Credential={}&X-Amz-Date={}&X-Amz-SignedHeaders=host",
        ALGORITHM,
        uri_encode(&format!("{}/{}", access_key_id, scope)),
        amz_date,
    );

    let canonical_request = format!(
        "GET\n{}\n{}\nhost:{}\n\nhost\n{}",
        CANONICAL_PATH,
        query,
        host,
        hex::encode(Sha256::digest(b"")),
    );

    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes())),
    );

    let mut key = hmac(format!("AWS4{}", secret_key).as_bytes(), date_stamp.as_bytes())?;
    for part in [region, IOT_SERVICE, "aws4_request"] {
        key = hmac(&key, part.as_bytes())?;
    }
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "{}://{}{}?{}&X-Amz-Signature={}",
        protocol, host, CANONICAL_PATH, query, signature
    ))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SenderError::Signing(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// RFC 3986 encoding as SigV4 expects it.
fn uri_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const HOST: &str = "a1b2c3-ats.iot.eu-west-1.amazonaws.com";

    #[test]
    fn test_region_from_host() {
        assert_eq!(region_from_iot_host(HOST), Some("eu-west-1"));
        assert_eq!(region_from_iot_host("broker.example.com"), None);
    }

    #[test]
    fn test_presigned_url_shape() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let url = presign_iot_websocket_url("wss", HOST, "AKIDEXAMPLE", "secret", now).unwrap();

        assert!(url.starts_with(&format!("wss://{}/mqtt?X-Amz-Algorithm=AWS4-HMAC-SHA256", HOST)));
        assert!(url.contains(
            "X-Amz-Credential=AKIDEXAMPLE%2F20240301%2Feu-west-1%2Fiotdevicegateway%2Faws4_request"
        ));
        assert!(url.contains("X-Amz-Date=20240301T123000Z"));

        let signature = url.rsplit("X-Amz-Signature=").next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_signature_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        let a = presign_iot_websocket_url("wss", HOST, "AK", "secret", now).unwrap();
        let b = presign_iot_websocket_url("wss", HOST, "AK", "secret", now).unwrap();
        let c = presign_iot_websocket_url("wss", HOST, "AK", "other", now).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_unknown_region_fails() {
        let err = presign_iot_websocket_url("wss", "localhost", "AK", "s", Utc::now()).unwrap_err();
        assert!(matches!(err, SenderError::Signing(_)));
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a/b c~"), "a%2Fb%20c~");
    }
}
