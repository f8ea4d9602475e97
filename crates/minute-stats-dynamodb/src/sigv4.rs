//! AWS Signature Version 4 for the JSON protocol requests we send.
//!
//! Only the parts DynamoDB needs are here: requests go to `/` with no
//! query string, so the canonical URI and query are fixed.
use crate::credentials::Credentials;
use aws_lc_rs::hmac::Key;
use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use std::collections::BTreeMap;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// What gets signed. Header names may be given in any case; they are
/// lowercased when canonicalized.
pub struct SigningRequest<'a> {
    pub method: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub headers: BTreeMap<String, String>,
    pub payload: &'a [u8],
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Signature {
    pub authorization: String,
    /// `YYYYMMDD'T'HHMMSS'Z'`, to be sent as `x-amz-date`
    pub amz_date: String,
    pub canonical_request: String,
    pub signature: String,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = Key::new(aws_lc_rs::hmac::HMAC_SHA256, key);
    aws_lc_rs::hmac::sign(&key, data).as_ref().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    use aws_lc_rs::digest;
    HEXLOWER.encode(digest::digest(&digest::SHA256, data).as_ref())
}

/// Returns the canonical header block and the signed header list
fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let headers: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| {
            let value = v.split_whitespace().collect::<Vec<_>>().join(" ");
            (k.to_lowercase(), value)
        })
        .collect();

    let block = headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}\n"))
        .collect::<String>();
    let signed = headers.keys().cloned().collect::<Vec<_>>().join(";");
    (block, signed)
}

fn signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{secret_key}").as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// Signs `req`. The `x-amz-date` header, and `x-amz-security-token`
/// when the credentials carry one, are added to the signed set; the
/// caller must send both along with the returned authorization.
pub fn sign(mut req: SigningRequest, credentials: &Credentials) -> Signature {
    let amz_date = req.timestamp.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = req.timestamp.format("%Y%m%d").to_string();

    req.headers
        .insert("x-amz-date".to_string(), amz_date.clone());
    if let Some(token) = &credentials.session_token {
        req.headers
            .insert("x-amz-security-token".to_string(), token.clone());
    }

    let payload_hash = sha256_hex(req.payload);
    let (headers, signed_headers) = canonical_headers(&req.headers);
    let canonical_request = format!(
        "{method}\n/\n\n{headers}\n{signed_headers}\n{payload_hash}",
        method = req.method
    );

    let scope = format!(
        "{date_stamp}/{region}/{service}/aws4_request",
        region = req.region,
        service = req.service
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(
        &credentials.secret_access_key,
        &date_stamp,
        req.region,
        req.service,
    );
    let signature = HEXLOWER.encode(&hmac_sha256(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={access_key}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        access_key = credentials.access_key_id
    );

    Signature {
        authorization,
        amz_date,
        canonical_request,
        signature,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn example_credentials() -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            session_token: None,
        }
    }

    fn example_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2015-08-30T12:36:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn digests() {
        k9::assert_equal!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        k9::assert_equal!(
            HEXLOWER.encode(&hmac_sha256(b"key", b"message")),
            "6e9ef29b75fffc5b7abae527d58fdadb2fe42e7219011976917343065f58ed4a"
        );
    }

    #[test]
    fn derived_signing_key() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        );
        k9::assert_equal!(
            HEXLOWER.encode(&key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn header_canonicalization() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Amz-Target".to_string(), " DynamoDB_20120810.Query ".to_string());
        headers.insert("Host".to_string(), "localhost:8000".to_string());
        headers.insert("content-type".to_string(), "a  b   c".to_string());
        let (block, signed) = canonical_headers(&headers);
        k9::assert_equal!(
            block,
            "content-type:a b c\nhost:localhost:8000\nx-amz-target:DynamoDB_20120810.Query\n"
        );
        k9::assert_equal!(signed, "content-type;host;x-amz-target");
    }

    /// The `get-vanilla` case from the AWS SigV4 test suite
    #[test]
    fn get_vanilla() {
        let mut headers = BTreeMap::new();
        headers.insert("Host".to_string(), "example.amazonaws.com".to_string());
        let signature = sign(
            SigningRequest {
                method: "GET",
                region: "us-east-1",
                service: "service",
                headers,
                payload: b"",
                timestamp: example_time(),
            },
            &example_credentials(),
        );

        k9::assert_equal!(signature.amz_date, "20150830T123600Z");
        k9::assert_equal!(
            signature.canonical_request,
            "GET\n/\n\nhost:example.amazonaws.com\nx-amz-date:20150830T123600Z\n\nhost;x-amz-date\ne3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        k9::assert_equal!(
            signature.signature,
            "5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
        k9::assert_equal!(
            signature.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, SignedHeaders=host;x-amz-date, Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        );
    }

    #[test]
    fn session_token_is_signed() {
        let mut credentials = example_credentials();
        credentials.session_token = Some("AQoDYXdzEJr".to_string());
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "dynamodb.us-east-1.amazonaws.com".to_string());
        let signature = sign(
            SigningRequest {
                method: "POST",
                region: "us-east-1",
                service: "dynamodb",
                headers,
                payload: br#"{"TableName":"stats"}"#,
                timestamp: example_time(),
            },
            &credentials,
        );
        assert!(
            signature
                .canonical_request
                .contains("x-amz-security-token:AQoDYXdzEJr\n")
        );
        assert!(
            signature
                .authorization
                .contains("SignedHeaders=host;x-amz-date;x-amz-security-token,")
        );
    }
}
