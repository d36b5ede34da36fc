//! Firebase Auth export (`firebase auth:export --format=json`) conversion.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::adapters::common::{normalize_provider, parse_timestamp, str_field};
use crate::config::FirebaseHashConfig;
use crate::error::{Error, Result};
use crate::target::{HashFormat, IdentityRecord, UserRecord};

/// Hash algorithm label recorded with every imported Firebase hash.
pub const HASH_ALGORITHM: &str = "SCRYPT";

/// Providers that are sign-in methods rather than linked accounts.
const NON_OAUTH_PROVIDERS: &[&str] = &["password", "phone", "anonymous"];

/// One exported account split into its target records.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedAccount {
    /// The user.
    pub user: UserRecord,
    /// Linked OAuth identities.
    pub identities: Vec<IdentityRecord>,
}

/// Deterministic identity ID for a provider link.
#[must_use]
pub fn identity_id(provider_id: &str, raw_id: &str) -> String {
    Uuid::new_v5(
        &Uuid::NAMESPACE_URL,
        format!("firebase:{provider_id}:{raw_id}").as_bytes(),
    )
    .to_string()
}

/// Per-user hash parameters stored next to the verbatim hash.
fn hash_params(salt: Option<&str>, config: Option<&FirebaseHashConfig>) -> Value {
    let mut params = Map::new();
    params.insert("algorithm".to_string(), json!(HASH_ALGORITHM));
    if let Some(salt) = salt {
        params.insert("salt".to_string(), json!(salt));
    }
    if let Some(config) = config {
        params.insert("signer_key".to_string(), json!(config.signer_key));
        params.insert("salt_separator".to_string(), json!(config.salt_separator));
        params.insert("rounds".to_string(), json!(config.rounds));
        params.insert("mem_cost".to_string(), json!(config.mem_cost));
    }
    Value::Object(params)
}

/// Custom claims are exported as a JSON-encoded string.
fn custom_claims(user: &Value) -> Map<String, Value> {
    match user.get("customAttributes") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => {
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(claims)) => claims,
                _ => {
                    let mut fallback = Map::new();
                    fallback.insert("custom_attributes".to_string(), json!(raw));
                    fallback
                }
            }
        }
        Some(Value::Object(claims)) => claims.clone(),
        _ => Map::new(),
    }
}

/// Converts one element of the export's `users` array.
///
/// # Errors
///
/// Returns [`Error::Extraction`] when the account has no `localId`.
pub fn convert_account(
    user: &Value,
    hash_config: Option<&FirebaseHashConfig>,
) -> Result<ExportedAccount> {
    let id = str_field(user, "localId")
        .ok_or_else(|| Error::Extraction("auth export account without localId".to_string()))?;

    let providers: Vec<&Value> = user
        .get("providerUserInfo")
        .and_then(Value::as_array)
        .map(|infos| infos.iter().collect())
        .unwrap_or_default();

    let email = str_field(user, "email");
    let phone = str_field(user, "phoneNumber");
    let password_hash = str_field(user, "passwordHash");
    let is_anonymous =
        providers.is_empty() && email.is_none() && phone.is_none() && password_hash.is_none();

    let created_at = user.get("createdAt").and_then(parse_timestamp);
    let last_sign_in_at = user.get("lastSignedInAt").and_then(parse_timestamp);

    let mut app_metadata = custom_claims(user);
    let provider_names: Vec<String> = providers
        .iter()
        .filter_map(|p| str_field(p, "providerId"))
        .map(|p| normalize_provider(&p))
        .collect();
    app_metadata.insert("providers".to_string(), json!(provider_names));

    let mut record = UserRecord::new(id.clone());
    record.email = email;
    record.phone = phone;
    record.email_verified = user
        .get("emailVerified")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    record.is_anonymous = is_anonymous;
    record.disabled = user.get("disabled").and_then(Value::as_bool).unwrap_or(false);
    record.display_name = str_field(user, "displayName");
    record.avatar_url = str_field(user, "photoUrl");
    record.app_metadata = Value::Object(app_metadata);
    record.created_at = created_at;
    record.updated_at = created_at;
    record.last_sign_in_at = last_sign_in_at;
    if let Some(hash) = password_hash {
        record.password_hash = Some(hash);
        record.password_hash_format = HashFormat::FirebaseScrypt;
        record.password_hash_params = Some(hash_params(
            str_field(user, "salt").as_deref(),
            hash_config,
        ));
    }

    let identities = providers
        .iter()
        .filter_map(|info| {
            let provider_id = str_field(info, "providerId")?;
            if NON_OAUTH_PROVIDERS.contains(&provider_id.as_str()) {
                return None;
            }
            let raw_id = str_field(info, "rawId")?;
            Some(IdentityRecord {
                id: identity_id(&provider_id, &raw_id),
                user_id: id.clone(),
                provider: normalize_provider(&provider_id),
                provider_user_id: raw_id,
                email: str_field(info, "email"),
                identity_data: (*info).clone(),
                created_at,
            })
        })
        .collect();

    Ok(ExportedAccount {
        user: record,
        identities,
    })
}
