use std::collections::HashMap;

pub(crate) const SERVICE_NAME: &str = "wick-sync";

async fn connect() -> Result<oo7::Keyring, String> {
    oo7::Keyring::new()
        .await
        .map_err(|e| format!("Failed to connect to keyring: {}", e))
}

fn attributes(account_id: &str) -> HashMap<&str, &str> {
    let mut attrs = HashMap::new();
    attrs.insert("service", SERVICE_NAME);
    attrs.insert("account", account_id);
    attrs
}

/// Load an account's access token, if one was stored.
pub async fn load_token(account_id: &str) -> Result<Option<String>, String> {
    let keyring = connect().await?;
    let items = keyring
        .search_items(&attributes(account_id))
        .await
        .map_err(|e| format!("Failed to search keyring: {}", e))?;

    let Some(item) = items.first() else {
        return Ok(None);
    };
    let secret = item
        .secret()
        .await
        .map_err(|e| format!("Failed to read secret: {}", e))?;
    let token = String::from_utf8(secret.to_vec())
        .map_err(|e| format!("Invalid UTF-8 in secret: {}", e))?;
    Ok(Some(token).filter(|t| !t.is_empty()))
}
