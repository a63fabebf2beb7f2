use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};

use super::ApiError;

const TOKEN_TTL_SECS: i64 = 600;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub nbf: i64,
    pub exp: i64,
    pub video: VideoGrant,
    pub sip: SipGrant,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room_create: bool,
    pub room_admin: bool,
    pub room_list: bool,
    pub room_record: bool,
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct SipGrant {
    pub admin: bool,
    pub call: bool,
}

/// Server API token with room, recording and SIP admin grants.
pub fn service_token(api_key: &str, api_secret: &str) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        iss: api_key.to_string(),
        sub: api_key.to_string(),
        nbf: now,
        exp: now + TOKEN_TTL_SECS,
        video: VideoGrant {
            room_create: true,
            room_admin: true,
            room_list: true,
            room_record: true,
        },
        sip: SipGrant {
            admin: true,
            call: true,
        },
    };

    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(api_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Token(e.to_string()))
}
